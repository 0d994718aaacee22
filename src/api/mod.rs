//! API layer
//!
//! HTTP handlers for:
//! - Federation (actors, inboxes, outboxes, objects)
//! - Well-known discovery (WebFinger, NodeInfo)
//! - Paged list endpoints
//! - Metrics (Prometheus)

mod federation;
pub mod metrics;
mod timelines;
mod wellknown;

pub use federation::federation_router;
pub use metrics::{metrics_router, track_http};
pub use timelines::timelines_router;
pub use wellknown::wellknown_router;
