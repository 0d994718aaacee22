//! Entity resolver
//!
//! Resolves remote actors by URI (store first, then a signed fetch of the
//! actor document) and handles by WebFinger discovery. Fetched actors are
//! persisted as remote-flagged shadow rows with `last_fetched_at` recorded
//! for the staleness sweep.
//!
//! Lookup failures are soft: `resolve` and `discover` return `None` for
//! unreachable hosts, refused targets and malformed documents, and the
//! failed key enters a cooldown during which it is not fetched again.
//! Only storage errors propagate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;

use super::client::FederationClient;
use super::cooldown::LookupCooldown;
use super::entity::{UserDocument, uri_authority};
use super::signature::{KeyResolver, SigningIdentity};
use super::webfinger;
use crate::data::{Actor, Database, EntityId};
use crate::error::AppError;

pub struct EntityResolver {
    db: Arc<Database>,
    client: Arc<FederationClient>,
    /// Instance actor used to sign fetches
    signer: Arc<SigningIdentity>,
    cooldown: LookupCooldown,
    actor_ttl: Duration,
    /// Scheme used for WebFinger queries
    scheme: String,
}

impl EntityResolver {
    pub fn new(
        db: Arc<Database>,
        client: Arc<FederationClient>,
        signer: Arc<SigningIdentity>,
        actor_ttl: Duration,
        lookup_cooldown: Duration,
        scheme: impl Into<String>,
    ) -> Self {
        Self {
            db,
            client,
            signer,
            cooldown: LookupCooldown::new(lookup_cooldown),
            actor_ttl,
            scheme: scheme.into(),
        }
    }

    /// Resolve an actor by URI
    ///
    /// # Returns
    /// The stored or freshly fetched actor, or None if it cannot be resolved
    ///
    /// # Errors
    /// Storage errors only
    pub async fn resolve(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        if let Some(actor) = self.db.get_actor_by_uri(uri).await? {
            observe_lookup("store");
            return Ok(Some(actor));
        }

        if self.cooldown.is_cooling_down(uri).await {
            observe_lookup("cooldown");
            tracing::debug!(%uri, "Actor lookup skipped during cooldown");
            return Ok(None);
        }

        match self.fetch_actor(uri).await {
            Ok(fetched) => {
                let stored = self.db.upsert_remote_actor(&fetched).await?;
                self.cooldown.clear(uri).await;
                observe_lookup("remote");
                tracing::info!(%uri, id = %stored.id, "Resolved remote actor");
                Ok(Some(stored))
            }
            Err(AppError::Database(error)) => Err(AppError::Database(error)),
            Err(error) => {
                self.cooldown.mark_failed(uri).await;
                observe_lookup("failed");
                tracing::warn!(%uri, %error, "Actor could not be resolved");
                Ok(None)
            }
        }
    }

    /// Refresh a stored remote actor from its document
    ///
    /// Strictly an update of the existing row.
    ///
    /// # Errors
    /// - `NotFound` if no remote row exists for `uri`
    /// - fetch and validation errors, unsoftened, so callers can retry
    pub async fn refresh(&self, uri: &str) -> Result<Actor, AppError> {
        let fetched = self.fetch_actor(uri).await?;
        if !self.db.update_remote_actor(&fetched).await? {
            return Err(AppError::NotFound);
        }
        observe_lookup("refresh");

        self.db
            .get_actor_by_uri(uri)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Whether a remote actor is due for a refresh
    pub fn is_stale(&self, actor: &Actor) -> bool {
        if !actor.is_remote {
            return false;
        }
        match actor.last_fetched_at {
            Some(fetched_at) => {
                let age = Utc::now().signed_duration_since(fetched_at);
                age.to_std().map(|age| age > self.actor_ttl).unwrap_or(false)
            }
            None => true,
        }
    }

    /// Discover the canonical URI for `username@domain`
    pub async fn discover(&self, username: &str, domain: &str) -> Result<Option<String>, AppError> {
        let key = format!("acct:{}@{}", username, domain);
        if self.cooldown.is_cooling_down(&key).await {
            observe_lookup("cooldown");
            return Ok(None);
        }

        match webfinger::lookup(&self.client, &self.scheme, username, domain).await {
            Ok(Some(uri)) => Ok(Some(uri)),
            Ok(None) => {
                self.cooldown.mark_failed(&key).await;
                Ok(None)
            }
            Err(error) => {
                self.cooldown.mark_failed(&key).await;
                tracing::warn!(handle = %key, %error, "WebFinger discovery failed");
                Ok(None)
            }
        }
    }

    /// Discover and resolve a handle in one step
    pub async fn resolve_handle(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<Actor>, AppError> {
        match self.discover(username, domain).await? {
            Some(uri) => self.resolve(&uri).await,
            None => Ok(None),
        }
    }

    /// Drop expired cooldown entries
    pub async fn prune_cooldown(&self) {
        self.cooldown.prune_expired().await;
    }

    async fn fetch_actor(&self, uri: &str) -> Result<Actor, AppError> {
        let document = self.client.get_json(uri, Some(self.signer.as_ref())).await?;
        let user = parse_actor_document(document, uri)?;
        Ok(actor_from_document(user))
    }
}

#[async_trait]
impl KeyResolver for EntityResolver {
    async fn public_key(&self, actor_uri: &str) -> Result<Option<String>, AppError> {
        let Some(actor) = self.resolve(actor_uri).await? else {
            return Ok(None);
        };

        if self.is_stale(&actor) {
            match self.refresh(actor_uri).await {
                Ok(refreshed) => return Ok(Some(refreshed.public_key)),
                Err(AppError::Database(error)) => return Err(AppError::Database(error)),
                Err(error) => {
                    tracing::debug!(uri = %actor_uri, %error, "Refresh failed, using stored key");
                }
            }
        }

        Ok(Some(actor.public_key))
    }
}

/// Validate the shape of a fetched actor document
///
/// # Errors
/// `Protocol` unless the document is a `User` whose `uri` equals the
/// requested URI, with an http(s) inbox on the same authority and a
/// 32-byte Ed25519 key
pub fn parse_actor_document(
    document: serde_json::Value,
    requested_uri: &str,
) -> Result<UserDocument, AppError> {
    let tag = document.get("type").and_then(|tag| tag.as_str());
    if tag != Some("User") {
        return Err(AppError::Protocol(format!(
            "Expected a User document, got {:?}",
            tag
        )));
    }

    let user: UserDocument = serde_json::from_value(document)
        .map_err(|e| AppError::Protocol(format!("Malformed actor document: {}", e)))?;

    if user.uri != requested_uri {
        return Err(AppError::Protocol(format!(
            "Actor document uri {} does not match {}",
            user.uri, requested_uri
        )));
    }

    let inbox = url::Url::parse(&user.inbox)
        .map_err(|_| AppError::Protocol("Actor inbox is not a URL".to_string()))?;
    if !matches!(inbox.scheme(), "http" | "https")
        || uri_authority(&user.inbox) != uri_authority(&user.uri)
    {
        return Err(AppError::Protocol(
            "Actor inbox must be an http(s) URL on the actor's host".to_string(),
        ));
    }

    let key_len = BASE64
        .decode(user.public_key.trim())
        .map(|bytes| bytes.len())
        .unwrap_or(0);
    if key_len != 32 {
        return Err(AppError::Protocol(
            "Actor public key is not an Ed25519 key".to_string(),
        ));
    }

    if user.username.is_empty() {
        return Err(AppError::Protocol("Actor username is empty".to_string()));
    }

    Ok(user)
}

/// Remote shadow row for a validated document
pub fn actor_from_document(user: UserDocument) -> Actor {
    let now = Utc::now();
    Actor {
        id: EntityId::new().0,
        domain: uri_authority(&user.uri),
        uri: user.uri,
        username: user.username,
        display_name: user.display_name,
        inbox_url: user.inbox,
        outbox_url: user.outbox,
        public_key: user.public_key,
        private_key: None,
        is_remote: true,
        manually_approves_followers: user.manually_approves_followers,
        last_fetched_at: Some(now),
        created_at: now,
        updated_at: now,
    }
}

fn observe_lookup(source: &str) {
    crate::metrics::RESOLVER_LOOKUPS_TOTAL
        .with_label_values(&[source])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::signature::generate_keypair;
    use serde_json::json;

    const URI: &str = "https://remote.example/users/alice";

    fn document(public_key: &str) -> serde_json::Value {
        json!({
            "type": "User",
            "uri": URI,
            "username": "alice",
            "inbox": "https://remote.example/users/alice/inbox",
            "public_key": public_key,
        })
    }

    #[test]
    fn valid_document_becomes_remote_actor() {
        let (_, public_key) = generate_keypair();
        let user = parse_actor_document(document(&public_key), URI).unwrap();
        let actor = actor_from_document(user);

        assert!(actor.is_remote);
        assert_eq!(actor.domain.as_deref(), Some("remote.example"));
        assert!(actor.last_fetched_at.is_some());
        assert!(actor.private_key.is_none());
    }

    #[test]
    fn document_for_another_uri_is_rejected() {
        let (_, public_key) = generate_keypair();
        match parse_actor_document(document(&public_key), "https://remote.example/users/bob") {
            Err(AppError::Protocol(msg)) => assert!(msg.contains("does not match")),
            other => panic!("expected uri mismatch, got: {other:?}"),
        }
    }

    #[test]
    fn foreign_inbox_is_rejected() {
        let (_, public_key) = generate_keypair();
        let mut doc = document(&public_key);
        doc["inbox"] = json!("https://elsewhere.example/inbox");
        assert!(matches!(
            parse_actor_document(doc, URI),
            Err(AppError::Protocol(_))
        ));
    }

    #[test]
    fn non_user_or_bad_key_is_rejected() {
        let mut doc = document("c2hvcnQ=");
        assert!(parse_actor_document(doc.clone(), URI).is_err());

        let (_, public_key) = generate_keypair();
        doc = document(&public_key);
        doc["type"] = json!("Service");
        assert!(parse_actor_document(doc, URI).is_err());
    }
}
