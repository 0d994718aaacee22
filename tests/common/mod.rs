//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use meridian::config::{self, QueueConfig};
use meridian::data::{Actor, Job};
use meridian::federation::SigningIdentity;
use meridian::federation::signature::sign_request;
use meridian::{AppState, build_router};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Test server instance
///
/// Binds a loopback port first so the configured domain (`127.0.0.1:port`)
/// matches the address peers reach it at.
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
    shutdown: watch::Sender<bool>,
}

/// Queue settings that retry immediately
pub fn fast_queue(max_attempts: u32) -> QueueConfig {
    QueueConfig {
        concurrency: 2,
        max_attempts,
        base_backoff_ms: 0,
        max_backoff_ms: 0,
        visibility_timeout_secs: 30,
        poll_interval_ms: 20,
    }
}

impl TestServer {
    /// Create a new test server instance with running queue workers
    pub async fn new() -> Self {
        Self::with_queues(fast_queue(3)).await
    }

    /// Same as [`TestServer::new`] with custom settings for all queues
    pub async fn with_queues(queue: QueueConfig) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Create test configuration
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            instance: config::InstanceConfig {
                title: "Test Instance".to_string(),
                description: "Test Meridian Instance".to_string(),
                actor_username: "actor".to_string(),
            },
            federation: config::FederationConfig {
                signature_max_age_secs: 300,
                actor_ttl_secs: 86_400,
                lookup_cooldown_secs: 300,
                allow_private_addresses: true,
                request_timeout_secs: 5,
                max_body_bytes: 64 * 1024,
                refresh_interval_secs: 3600,
            },
            queues: config::QueuesConfig {
                inbox: queue.clone(),
                delivery: queue.clone(),
                fetch: queue,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config).await.unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        state.spawn_workers(shutdown_rx);

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Spawn server in background
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
            shutdown,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// `user@domain` of a local username
    pub fn acct(&self, username: &str) -> String {
        format!("{}@{}", username, self.state.config.server.domain)
    }

    /// Register a local actor
    pub async fn register(&self, username: &str, manually_approves: bool) -> Actor {
        self.state
            .service
            .register_local_actor(username, None, manually_approves)
            .await
            .unwrap()
    }

    /// POST `body` to `path`, signed by `identity`
    pub async fn post_signed(
        &self,
        path: &str,
        identity: &SigningIdentity,
        body: &serde_json::Value,
    ) -> reqwest::Response {
        let url = self.url(path);
        let body = serde_json::to_vec(body).unwrap();

        let mut request = self
            .client
            .post(&url)
            .header("content-type", "application/json");
        for (name, value) in sign_request(identity, "POST", &url, &body)
            .unwrap()
            .header_pairs()
        {
            request = request.header(name, value);
        }
        request.body(body).send().await.unwrap()
    }

    /// Poll a job until it reaches a terminal status
    pub async fn wait_for_job(&self, job_id: &str) -> Job {
        for _ in 0..250 {
            let job = self.state.db.get_job(job_id).await.unwrap().unwrap();
            if job.status().is_some_and(|status| status.is_terminal()) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} did not finish in time");
    }

    /// Stop the queue workers
    pub fn stop_workers(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Loopback address that refuses connections
pub async fn closed_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
