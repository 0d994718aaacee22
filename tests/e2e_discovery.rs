//! E2E tests for WebFinger discovery of remote handles

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{Json, Router, extract::State, routing::get};
use common::{TestServer, closed_address};
use meridian::federation::signature::generate_keypair;
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// What the mock's WebFinger endpoint answers with
#[derive(Clone, Copy)]
enum Jrd {
    Valid,
    Malformed,
    NoSelfLink,
}

/// Remote instance serving WebFinger for a single actor, `dave`
#[derive(Clone)]
struct MockDirectory {
    base_url: String,
    public_key: String,
    jrd: Jrd,
    hits: Arc<AtomicUsize>,
}

impl MockDirectory {
    async fn start(jrd: Jrd) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (_, public_key) = generate_keypair();

        let mock = Self {
            base_url: format!("http://{}", addr),
            public_key,
            jrd,
            hits: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route("/.well-known/webfinger", get(webfinger))
            .route("/users/dave", get(actor))
            .with_state(mock.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        mock
    }

    fn dave_uri(&self) -> String {
        format!("{}/users/dave", self.base_url)
    }

    fn domain(&self) -> &str {
        self.base_url.trim_start_matches("http://")
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn webfinger(State(mock): State<MockDirectory>) -> Json<Value> {
    mock.hits.fetch_add(1, Ordering::SeqCst);
    let subject = format!("acct:dave@{}", mock.domain());
    Json(match mock.jrd {
        Jrd::Valid => json!({
            "subject": subject,
            "links": [
                {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": format!("{}/@dave", mock.base_url)},
                {"rel": "self", "type": "application/activity+json", "href": mock.dave_uri()},
            ]
        }),
        Jrd::Malformed => json!({ "links": "not-a-list" }),
        Jrd::NoSelfLink => json!({
            "subject": subject,
            "links": [
                {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": format!("{}/@dave", mock.base_url)},
            ]
        }),
    })
}

async fn actor(State(mock): State<MockDirectory>) -> Json<Value> {
    Json(json!({
        "type": "User",
        "uri": mock.dave_uri(),
        "username": "dave",
        "inbox": format!("{}/inbox", mock.dave_uri()),
        "public_key": mock.public_key,
    }))
}

#[tokio::test]
async fn test_valid_jrd_yields_actor_uri() {
    let server = TestServer::new().await;
    let remote = MockDirectory::start(Jrd::Valid).await;

    let uri = server
        .state
        .resolver
        .discover("dave", remote.domain())
        .await
        .unwrap();

    assert_eq!(uri, Some(remote.dave_uri()));
    assert_eq!(remote.hits(), 1);
}

#[tokio::test]
async fn test_resolve_handle_stores_discovered_actor() {
    let server = TestServer::new().await;
    let remote = MockDirectory::start(Jrd::Valid).await;

    let dave = server
        .state
        .resolver
        .resolve_handle("dave", remote.domain())
        .await
        .unwrap()
        .expect("handle should resolve");

    assert_eq!(dave.uri, remote.dave_uri());
    assert!(dave.is_remote);
    assert_eq!(dave.public_key, remote.public_key);
    let stored = server
        .state
        .db
        .get_actor_by_uri(&remote.dave_uri())
        .await
        .unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_malformed_jrd_yields_none() {
    let server = TestServer::new().await;

    for jrd in [Jrd::Malformed, Jrd::NoSelfLink] {
        let remote = MockDirectory::start(jrd).await;
        let uri = server
            .state
            .resolver
            .discover("dave", remote.domain())
            .await
            .unwrap();
        assert_eq!(uri, None);
        assert_eq!(remote.hits(), 1);
    }
}

#[tokio::test]
async fn test_unreachable_host_yields_none() {
    let server = TestServer::new().await;
    let addr = closed_address().await;

    let uri = server
        .state
        .resolver
        .discover("dave", &addr.to_string())
        .await
        .unwrap();
    assert_eq!(uri, None);

    let actor = server
        .state
        .resolver
        .resolve_handle("dave", &addr.to_string())
        .await
        .unwrap();
    assert!(actor.is_none());
}

#[tokio::test]
async fn test_failed_lookup_is_not_repeated_during_cooldown() {
    let server = TestServer::new().await;
    let remote = MockDirectory::start(Jrd::Malformed).await;

    for _ in 0..3 {
        let uri = server
            .state
            .resolver
            .discover("dave", remote.domain())
            .await
            .unwrap();
        assert_eq!(uri, None);
    }

    assert_eq!(remote.hits(), 1);
}
