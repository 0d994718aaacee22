//! E2E tests for outbound delivery and the fetch queue against a mock
//! remote instance.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use common::{TestServer, fast_queue};
use meridian::data::{FollowTransition, JobStatus, Visibility};
use meridian::federation::signature::{SIGNED_BY_HEADER, generate_keypair};
use meridian::federation::{Entity, TargetedEntity};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Remote instance with a single actor, `carol`, whose inbox answers with
/// a fixed status
#[derive(Clone)]
struct MockRemote {
    base_url: String,
    public_key: String,
    inbox_status: StatusCode,
    hits: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

impl MockRemote {
    async fn start(inbox_status: StatusCode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (_, public_key) = generate_keypair();

        let mock = Self {
            base_url: format!("http://{}", addr),
            public_key,
            inbox_status,
            hits: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/users/carol", get(actor))
            .route("/users/carol/inbox", post(inbox))
            .route("/.well-known/nodeinfo", get(nodeinfo_links))
            .route("/nodeinfo/2.0", get(nodeinfo))
            .with_state(mock.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        mock
    }

    fn carol_uri(&self) -> String {
        format!("{}/users/carol", self.base_url)
    }

    fn domain(&self) -> &str {
        self.base_url.trim_start_matches("http://")
    }
}

async fn actor(State(mock): State<MockRemote>) -> Json<Value> {
    Json(json!({
        "type": "User",
        "uri": mock.carol_uri(),
        "username": "carol",
        "inbox": format!("{}/inbox", mock.carol_uri()),
        "public_key": mock.public_key,
    }))
}

async fn inbox(State(mock): State<MockRemote>, headers: HeaderMap, body: Bytes) -> StatusCode {
    mock.hits.fetch_add(1, Ordering::SeqCst);
    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
        mock.received.lock().await.push((headers, value));
    }
    mock.inbox_status
}

async fn nodeinfo_links(State(mock): State<MockRemote>) -> Json<Value> {
    Json(json!({
        "links": [{
            "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
            "href": format!("{}/nodeinfo/2.0", mock.base_url),
        }]
    }))
}

async fn nodeinfo() -> Json<Value> {
    Json(json!({
        "version": "2.0",
        "software": { "name": "mockverse", "version": "9.9" },
        "protocols": ["meridian"],
        "openRegistrations": true,
        "usage": {},
        "metadata": { "nodeName": "Mock" },
    }))
}

fn follow_entity(server: &TestServer, author: &str, target: &str) -> Entity {
    Entity::Follow(TargetedEntity {
        uri: server.url(&format!("/activities/{}", meridian::data::EntityId::new().0)),
        author: author.to_string(),
        target: target.to_string(),
    })
}

#[tokio::test]
async fn test_server_error_is_retried_then_dead_lettered() {
    let server = TestServer::with_queues(fast_queue(3)).await;
    let remote = MockRemote::start(StatusCode::SERVICE_UNAVAILABLE).await;
    let alice = server.register("alice", false).await;

    let entity = follow_entity(&server, &alice.uri, &remote.carol_uri());
    let job = server
        .state
        .delivery
        .federate_entity(&entity, &alice, &remote.carol_uri())
        .await
        .unwrap();

    let job = server.wait_for_job(&job.id).await;
    assert_eq!(job.status(), Some(JobStatus::DeadLettered));
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.as_deref().unwrap_or_default().contains("503"));
    assert_eq!(remote.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_client_error_fails_without_retry() {
    let server = TestServer::with_queues(fast_queue(5)).await;
    let remote = MockRemote::start(StatusCode::FORBIDDEN).await;
    let alice = server.register("alice", false).await;

    let entity = follow_entity(&server, &alice.uri, &remote.carol_uri());
    let job = server
        .state
        .delivery
        .federate_entity(&entity, &alice, &remote.carol_uri())
        .await
        .unwrap();

    let job = server.wait_for_job(&job.id).await;
    assert_eq!(job.status(), Some(JobStatus::Failed));
    assert_eq!(job.attempts, 1);

    // Give a wrongly scheduled retry the chance to show up
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_note_fans_out_to_remote_followers() {
    let server = TestServer::new().await;
    let remote = MockRemote::start(StatusCode::ACCEPTED).await;
    let alice = server.register("alice", false).await;

    let carol = server
        .state
        .resolver
        .resolve(&remote.carol_uri())
        .await
        .unwrap()
        .unwrap();
    server
        .state
        .db
        .apply_follow_transition(&carol.id, &alice.id, FollowTransition::Accept)
        .await
        .unwrap();

    let note = server
        .state
        .service
        .create_note(&alice, "hello followers", Visibility::Public, None)
        .await
        .unwrap();

    for _ in 0..250 {
        if remote.hits.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let received = remote.received.lock().await;
    assert_eq!(received.len(), 1);
    let (headers, body) = &received[0];
    assert_eq!(headers[SIGNED_BY_HEADER].to_str().unwrap(), alice.uri);
    assert_eq!(body["type"], "Note");
    assert_eq!(body["uri"], note.uri);
    assert_eq!(body["author"], alice.uri);
}

#[tokio::test]
async fn test_direct_note_is_not_delivered() {
    let server = TestServer::new().await;
    let remote = MockRemote::start(StatusCode::ACCEPTED).await;
    let alice = server.register("alice", false).await;
    let carol = server
        .state
        .resolver
        .resolve(&remote.carol_uri())
        .await
        .unwrap()
        .unwrap();
    server
        .state
        .db
        .apply_follow_transition(&carol.id, &alice.id, FollowTransition::Accept)
        .await
        .unwrap();

    server
        .state
        .service
        .create_note(&alice, "just for me", Visibility::Direct, None)
        .await
        .unwrap();

    let pending = server
        .state
        .db
        .count_jobs("delivery", JobStatus::Pending)
        .await
        .unwrap();
    assert_eq!(pending, 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fetch_queue_stores_actor_and_instance() {
    let server = TestServer::new().await;
    let remote = MockRemote::start(StatusCode::ACCEPTED).await;

    let job = server
        .state
        .fetch
        .enqueue_user(&remote.carol_uri())
        .await
        .unwrap();
    let job = server.wait_for_job(&job.id).await;
    assert_eq!(job.status(), Some(JobStatus::Completed));

    let carol = server
        .state
        .db
        .get_actor_by_uri(&remote.carol_uri())
        .await
        .unwrap()
        .unwrap();
    assert!(carol.is_remote);
    assert_eq!(carol.public_key, remote.public_key);

    let mut instance = None;
    for _ in 0..250 {
        instance = server
            .state
            .db
            .get_instance_by_domain(remote.domain())
            .await
            .unwrap();
        if instance.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let instance = instance.expect("instance metadata was never fetched");
    assert_eq!(instance.software_name.as_deref(), Some("mockverse"));
}
