//! Meridian - a federation exchange layer
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inboxes, outboxes, actor and object documents            │
//! │  - WebFinger / NodeInfo discovery                           │
//! │  - Paged list endpoints, metrics                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Queues and Federation                       │
//! │  - Inbox state machine, delivery, fetch/refetch             │
//! │  - Ed25519 request signatures, entity resolver              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx), durable job table                         │
//! │  - Keyset cursor pagination                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Local operations that produce outbound entities
//! - `federation`: Signatures, resolver, entity handlers, discovery
//! - `queue`: Durable job queues and their workers
//! - `data`: Database layer and pagination
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod queue;
pub mod service;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::federation::{
    EntityResolver, FederationClient, HandlerContext, HandlerRegistry, KeyResolver,
    SigningIdentity,
};
use crate::queue::{
    DeliveryQueue, DeliveryWorker, FetchQueue, FetchWorker, InboxQueue, InboxWorker,
};

/// Application state shared across all handlers
///
/// Cloned for each request; everything heavy sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub client: Arc<FederationClient>,

    /// Cached actor lookups and refreshes
    pub resolver: Arc<EntityResolver>,

    /// Local actor that signs fetches on behalf of the instance
    pub instance_actor: Arc<data::Actor>,

    pub inbox: InboxQueue,
    pub delivery: DeliveryQueue,
    pub fetch: FetchQueue,

    /// Handlers for verified inbound entities
    pub handlers: Arc<HandlerRegistry>,

    /// Local operations (notes, likes, follows)
    pub service: Arc<service::FederationService>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Ensure the instance actor exists
    /// 3. Build the federation client and resolver
    /// 4. Open the three queues
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Instance actor
        let instance_actor = Arc::new(Self::ensure_instance_actor(&db, &config).await?);
        let signer = Arc::new(SigningIdentity::from_actor(&instance_actor)?);

        // 3. Federation client and resolver
        let client = Arc::new(FederationClient::new(&config.federation)?);
        let resolver = Arc::new(EntityResolver::new(
            db.clone(),
            client.clone(),
            signer,
            config.federation.actor_ttl(),
            config.federation.lookup_cooldown(),
            config.server.protocol.clone(),
        ));

        // 4. Queues
        let inbox = InboxQueue::new(db.clone(), config.queues.inbox.clone());
        let delivery = DeliveryQueue::new(db.clone(), config.queues.delivery.clone());
        let fetch = FetchQueue::new(db.clone(), config.queues.fetch.clone());

        let service = Arc::new(service::FederationService::new(
            db.clone(),
            resolver.clone(),
            delivery.clone(),
            config.server.base_url(),
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            client,
            resolver,
            instance_actor,
            inbox,
            delivery,
            fetch,
            handlers: Arc::new(HandlerRegistry::with_defaults()),
            service,
        })
    }

    /// Load the instance actor, creating it with a fresh keypair if missing
    async fn ensure_instance_actor(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<data::Actor, error::AppError> {
        let username = &config.instance.actor_username;
        if let Some(actor) = db.get_local_actor_by_username(username).await? {
            tracing::info!(%username, "Instance actor exists");
            return Ok(actor);
        }

        let uri = federation::entity::local_actor_uri(&config.server.base_url(), username);
        let (private_key, public_key) = federation::signature::generate_keypair();
        let now = chrono::Utc::now();
        let actor = data::Actor {
            id: data::EntityId::new().0,
            inbox_url: format!("{}/inbox", uri),
            outbox_url: Some(format!("{}/outbox", uri)),
            uri,
            username: username.clone(),
            domain: None,
            display_name: Some(config.instance.title.clone()),
            public_key,
            private_key: Some(private_key),
            is_remote: false,
            manually_approves_followers: true,
            last_fetched_at: None,
            created_at: now,
            updated_at: now,
        };

        if db.insert_local_actor(&actor).await? {
            tracing::info!(%username, uri = %actor.uri, "Instance actor created");
            return Ok(actor);
        }

        // Lost a race with a concurrent start
        db.get_local_actor_by_username(username)
            .await?
            .ok_or(error::AppError::NotFound)
    }

    /// Context handed to inbound entity handlers
    pub fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            db: self.db.clone(),
            delivery: self.delivery.clone(),
            base_url: self.config.server.base_url(),
        }
    }

    /// Start the worker pools of all queues and the staleness sweep
    ///
    /// Every task stops once `shutdown` flips to `true`.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let keys: Arc<dyn KeyResolver> = self.resolver.clone();
        let inbox_worker = Arc::new(InboxWorker::new(
            keys,
            self.handlers.clone(),
            self.handler_context(),
            self.config.federation.signature_max_age(),
        ));
        let delivery_worker = Arc::new(DeliveryWorker::new(
            self.db.clone(),
            self.resolver.clone(),
            self.client.clone(),
        ));
        let fetch_worker = Arc::new(FetchWorker::new(
            self.db.clone(),
            self.resolver.clone(),
            self.client.clone(),
            self.fetch.clone(),
            self.config.server.protocol.clone(),
        ));

        let mut handles = Vec::new();
        handles.extend(queue::spawn_workers(
            self.inbox.queue().clone(),
            inbox_worker,
            shutdown.clone(),
        ));
        handles.extend(queue::spawn_workers(
            self.delivery.queue().clone(),
            delivery_worker,
            shutdown.clone(),
        ));
        handles.extend(queue::spawn_workers(
            self.fetch.queue().clone(),
            fetch_worker,
            shutdown.clone(),
        ));
        handles.push(queue::fetch::spawn_stale_sweep(
            self.fetch.clone(),
            self.resolver.clone(),
            self.config.federation.actor_ttl(),
            std::time::Duration::from_secs(self.config.federation.refresh_interval_secs.max(1)),
            shutdown,
        ));
        handles
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{Router, middleware};
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);
    let max_body_bytes = state.config.federation.max_body_bytes;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::federation_router(max_body_bytes))
        .merge(api::timelines_router())
        .route_layer(middleware::from_fn(api::track_http))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
