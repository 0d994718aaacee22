//! Federation module
//!
//! Handles:
//! - Request signatures (Ed25519 over a canonical string)
//! - Entity wire format and inbound handlers
//! - Actor resolution and WebFinger discovery
//! - NodeInfo
//! - Outbound HTTP with SSRF protection

pub mod client;
mod cooldown;
pub mod entity;
pub mod handlers;
pub mod nodeinfo;
pub mod resolver;
pub mod signature;
pub mod webfinger;

pub use client::FederationClient;
pub use cooldown::LookupCooldown;
pub use entity::{Entity, EntityEnvelope, EntityKind, NoteEntity, TargetedEntity, UserDocument};
pub use handlers::{EntityHandler, HandlerContext, HandlerRegistry};
pub use resolver::EntityResolver;
pub use signature::{KeyResolver, SignatureHeaders, SigningIdentity};
