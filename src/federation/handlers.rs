//! Inbound entity handlers
//!
//! One handler per entity type, looked up by the type tag after the inbox
//! worker has verified the signer. Every handler must be idempotent: the
//! inbox queue delivers at least once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::entity::{
    Entity, EntityKind, NoteEntity, TargetedEntity, local_activity_uri, parse_entity,
};
use super::resolver::{actor_from_document, parse_actor_document};
use crate::data::{Actor, Database, EntityId, FollowTransition, Like, Note};
use crate::error::AppError;
use crate::queue::DeliveryQueue;

/// Shared dependencies of entity handlers
#[derive(Clone)]
pub struct HandlerContext {
    pub db: Arc<Database>,
    pub delivery: DeliveryQueue,
    pub base_url: String,
}

/// Applies one verified entity to local state
#[async_trait]
pub trait EntityHandler: Send + Sync {
    /// # Arguments
    /// * `signer` - Verified author of the entity
    /// * `payload` - Raw entity, parsed by the handler into its own type
    async fn handle(
        &self,
        ctx: &HandlerContext,
        signer: &Actor,
        payload: Value,
    ) -> Result<(), AppError>;
}

/// Type tag to handler mapping
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EntityKind, Arc<dyn EntityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a handler for every known entity type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EntityKind::User, Arc::new(UserHandler));
        registry.register(EntityKind::Note, Arc::new(NoteHandler));
        registry.register(EntityKind::Like, Arc::new(LikeHandler));
        registry.register(EntityKind::Follow, Arc::new(FollowHandler));
        registry.register(EntityKind::FollowAccept, Arc::new(FollowAcceptHandler));
        registry.register(EntityKind::FollowReject, Arc::new(FollowRejectHandler));
        registry.register(EntityKind::Unfollow, Arc::new(UnfollowHandler));
        registry.register(EntityKind::Delete, Arc::new(DeleteHandler));
        registry
    }

    /// Register `handler` for `kind`, replacing any previous one
    pub fn register(&mut self, kind: EntityKind, handler: Arc<dyn EntityHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: EntityKind) -> Option<Arc<dyn EntityHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

async fn local_actor_by_uri(db: &Database, uri: &str) -> Result<Option<Actor>, AppError> {
    Ok(db
        .get_actor_by_uri(uri)
        .await?
        .filter(|actor| !actor.is_remote))
}

// =============================================================================
// Handlers
// =============================================================================

/// Actor document pushed by its owner
struct UserHandler;

#[async_trait]
impl EntityHandler for UserHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        signer: &Actor,
        payload: Value,
    ) -> Result<(), AppError> {
        let user = parse_actor_document(payload, &signer.uri)?;
        ctx.db
            .update_remote_actor(&actor_from_document(user))
            .await?;
        tracing::debug!(uri = %signer.uri, "Actor document updated");
        Ok(())
    }
}

struct NoteHandler;

#[async_trait]
impl EntityHandler for NoteHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        signer: &Actor,
        payload: Value,
    ) -> Result<(), AppError> {
        let entity: NoteEntity = parse_entity(payload, EntityKind::Note)?;
        let note = Note {
            id: EntityId::new().0,
            uri: entity.uri,
            author_id: signer.id.clone(),
            content: ammonia::clean(&entity.content),
            visibility: entity.visibility.as_str().to_string(),
            is_sensitive: entity.sensitive,
            replies_to_uri: entity.replies_to,
            is_local: false,
            created_at: entity.created_at,
            updated_at: entity.updated_at.unwrap_or(entity.created_at),
        };

        if !ctx.db.upsert_note(&note).await? {
            return Err(AppError::Protocol(format!(
                "Note {} belongs to another author",
                note.uri
            )));
        }
        Ok(())
    }
}

struct LikeHandler;

#[async_trait]
impl EntityHandler for LikeHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        signer: &Actor,
        payload: Value,
    ) -> Result<(), AppError> {
        let entity: TargetedEntity = parse_entity(payload, EntityKind::Like)?;

        if let Some(existing) = ctx.db.get_like_by_uri(&entity.uri).await? {
            if existing.author_id != signer.id {
                return Err(AppError::Protocol(format!(
                    "Like {} belongs to another author",
                    entity.uri
                )));
            }
            return Ok(());
        }

        ctx.db
            .insert_like_if_absent(&Like {
                id: EntityId::new().0,
                uri: entity.uri,
                author_id: signer.id.clone(),
                liked_uri: entity.target,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

/// Follow request towards a local actor
///
/// Auto-accepted unless the followee approves followers manually; an
/// accepted follow is answered with a `FollowAccept`. A redelivered follow
/// of an edge that is already accepted changes nothing.
struct FollowHandler;

#[async_trait]
impl EntityHandler for FollowHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        signer: &Actor,
        payload: Value,
    ) -> Result<(), AppError> {
        let entity: TargetedEntity = parse_entity(payload, EntityKind::Follow)?;
        let followee = local_actor_by_uri(&ctx.db, &entity.target)
            .await?
            .ok_or_else(|| {
                AppError::Protocol(format!("Follow target {} is not local", entity.target))
            })?;

        let existing = ctx.db.get_relationship(&signer.id, &followee.id).await?;
        if existing.is_some_and(|edge| edge.following) {
            tracing::debug!(follower = %signer.uri, followee = %followee.uri, "Follow already accepted");
            return Ok(());
        }

        if followee.manually_approves_followers {
            ctx.db
                .apply_follow_transition(&signer.id, &followee.id, FollowTransition::Request)
                .await?;
            tracing::info!(follower = %signer.uri, followee = %followee.uri, "Follow request pending approval");
            return Ok(());
        }

        ctx.db
            .apply_follow_transition(&signer.id, &followee.id, FollowTransition::Accept)
            .await?;

        let accept = Entity::FollowAccept(TargetedEntity {
            uri: local_activity_uri(&ctx.base_url, &EntityId::new().0),
            author: followee.uri.clone(),
            target: signer.uri.clone(),
        });
        ctx.delivery
            .federate_entity(&accept, &followee, &signer.uri)
            .await?;

        tracing::info!(follower = %signer.uri, followee = %followee.uri, "Follow accepted");
        Ok(())
    }
}

/// Remote followee accepted a local actor's request
struct FollowAcceptHandler;

#[async_trait]
impl EntityHandler for FollowAcceptHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        signer: &Actor,
        payload: Value,
    ) -> Result<(), AppError> {
        let entity: TargetedEntity = parse_entity(payload, EntityKind::FollowAccept)?;
        let follower = local_actor_by_uri(&ctx.db, &entity.target)
            .await?
            .ok_or_else(|| {
                AppError::Protocol(format!("Accepted follower {} is not local", entity.target))
            })?;

        let pending = ctx
            .db
            .get_relationship(&follower.id, &signer.id)
            .await?
            .is_some_and(|edge| edge.requested || edge.following);
        if !pending {
            return Err(AppError::Protocol(format!(
                "No follow request from {} to {}",
                follower.uri, signer.uri
            )));
        }

        ctx.db
            .apply_follow_transition(&follower.id, &signer.id, FollowTransition::Accept)
            .await
    }
}

/// Remote followee rejected a request, or removed a local follower
struct FollowRejectHandler;

#[async_trait]
impl EntityHandler for FollowRejectHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        signer: &Actor,
        payload: Value,
    ) -> Result<(), AppError> {
        let entity: TargetedEntity = parse_entity(payload, EntityKind::FollowReject)?;
        let follower = local_actor_by_uri(&ctx.db, &entity.target)
            .await?
            .ok_or_else(|| {
                AppError::Protocol(format!("Rejected follower {} is not local", entity.target))
            })?;

        ctx.db
            .apply_follow_transition(&follower.id, &signer.id, FollowTransition::Reject)
            .await
    }
}

struct UnfollowHandler;

#[async_trait]
impl EntityHandler for UnfollowHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        signer: &Actor,
        payload: Value,
    ) -> Result<(), AppError> {
        let entity: TargetedEntity = parse_entity(payload, EntityKind::Unfollow)?;
        let Some(followee) = ctx.db.get_actor_by_uri(&entity.target).await? else {
            return Ok(());
        };

        ctx.db
            .apply_follow_transition(&signer.id, &followee.id, FollowTransition::Unfollow)
            .await
    }
}

/// Removes a note or like owned by the signer; unknown targets are a no-op
struct DeleteHandler;

#[async_trait]
impl EntityHandler for DeleteHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        signer: &Actor,
        payload: Value,
    ) -> Result<(), AppError> {
        let entity: TargetedEntity = parse_entity(payload, EntityKind::Delete)?;

        if ctx.db.delete_note_by_uri(&entity.target, &signer.id).await? {
            tracing::debug!(uri = %entity.target, "Note deleted");
            return Ok(());
        }
        if ctx.db.delete_like_by_uri(&entity.target, &signer.id).await? {
            tracing::debug!(uri = %entity.target, "Like deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::data::JobStatus;
    use crate::federation::signature::generate_keypair;
    use serde_json::json;
    use tempfile::TempDir;

    const BASE: &str = "https://local.example";

    async fn setup() -> (HandlerContext, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("h.db")).await.unwrap());
        let delivery = DeliveryQueue::new(db.clone(), QueueConfig::default());
        (
            HandlerContext {
                db,
                delivery,
                base_url: BASE.to_string(),
            },
            temp_dir,
        )
    }

    fn actor(uri: &str, username: &str, remote: bool) -> Actor {
        let (private_key, public_key) = generate_keypair();
        let now = Utc::now();
        Actor {
            id: EntityId::new().0,
            uri: uri.to_string(),
            username: username.to_string(),
            domain: remote.then(|| "remote.example".to_string()),
            display_name: None,
            inbox_url: format!("{uri}/inbox"),
            outbox_url: None,
            public_key,
            private_key: (!remote).then_some(private_key),
            is_remote: remote,
            manually_approves_followers: false,
            last_fetched_at: remote.then_some(now),
            created_at: now,
            updated_at: now,
        }
    }

    async fn remote(ctx: &HandlerContext) -> Actor {
        ctx.db
            .upsert_remote_actor(&actor("https://remote.example/users/bob", "bob", true))
            .await
            .unwrap()
    }

    async fn local(ctx: &HandlerContext, manual: bool) -> Actor {
        let mut alice = actor(&format!("{BASE}/users/alice"), "alice", false);
        alice.manually_approves_followers = manual;
        ctx.db.insert_local_actor(&alice).await.unwrap();
        alice
    }

    fn note_payload(uri: &str, author: &str, content: &str) -> Value {
        json!({
            "type": "Note",
            "uri": uri,
            "author": author,
            "content": content,
            "visibility": "public",
            "created_at": "2026-01-01T00:00:00Z"
        })
    }

    #[test]
    fn default_registry_covers_every_kind() {
        let registry = HandlerRegistry::with_defaults();
        for kind in EntityKind::ALL {
            assert!(registry.get(kind).is_some(), "missing handler for {kind:?}");
        }
        assert!(HandlerRegistry::new().get(EntityKind::Note).is_none());
    }

    #[tokio::test]
    async fn note_is_sanitized_and_idempotent() {
        let (ctx, _temp_dir) = setup().await;
        let bob = remote(&ctx).await;
        let uri = "https://remote.example/objects/1";
        let payload = note_payload(uri, &bob.uri, "<p>hi</p><script>alert(1)</script>");

        NoteHandler.handle(&ctx, &bob, payload.clone()).await.unwrap();
        NoteHandler.handle(&ctx, &bob, payload).await.unwrap();

        let stored = ctx.db.get_note_by_uri(uri).await.unwrap().unwrap();
        assert_eq!(stored.author_id, bob.id);
        assert!(!stored.content.contains("script"));
    }

    #[tokio::test]
    async fn note_of_another_author_is_refused() {
        let (ctx, _temp_dir) = setup().await;
        let bob = remote(&ctx).await;
        let mallory = ctx
            .db
            .upsert_remote_actor(&actor("https://remote.example/users/mallory", "mallory", true))
            .await
            .unwrap();
        let uri = "https://remote.example/objects/2";

        NoteHandler
            .handle(&ctx, &bob, note_payload(uri, &bob.uri, "original"))
            .await
            .unwrap();
        let result = NoteHandler
            .handle(&ctx, &mallory, note_payload(uri, &mallory.uri, "hijack"))
            .await;

        assert!(matches!(result, Err(AppError::Protocol(_))));
        let stored = ctx.db.get_note_by_uri(uri).await.unwrap().unwrap();
        assert_eq!(stored.content, "original");
    }

    #[tokio::test]
    async fn follow_auto_accepts_and_queues_reply() {
        let (ctx, _temp_dir) = setup().await;
        let bob = remote(&ctx).await;
        let alice = local(&ctx, false).await;

        let follow = json!({
            "type": "Follow",
            "uri": "https://remote.example/activities/f1",
            "author": bob.uri,
            "target": alice.uri,
        });
        FollowHandler.handle(&ctx, &bob, follow).await.unwrap();

        let edge = ctx.db.get_relationship(&bob.id, &alice.id).await.unwrap().unwrap();
        assert!(edge.following);
        let mirror = ctx.db.get_relationship(&alice.id, &bob.id).await.unwrap().unwrap();
        assert!(mirror.followed_by);
        assert_eq!(
            ctx.db.count_jobs("delivery", JobStatus::Pending).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn redelivered_follow_is_accepted_once() {
        let (ctx, _temp_dir) = setup().await;
        let bob = remote(&ctx).await;
        let alice = local(&ctx, false).await;

        let follow = json!({
            "type": "Follow",
            "uri": "https://remote.example/activities/f3",
            "author": bob.uri,
            "target": alice.uri,
        });
        FollowHandler.handle(&ctx, &bob, follow.clone()).await.unwrap();
        FollowHandler.handle(&ctx, &bob, follow).await.unwrap();

        let edge = ctx.db.get_relationship(&bob.id, &alice.id).await.unwrap().unwrap();
        assert!(edge.following);
        assert_eq!(
            ctx.db.count_jobs("delivery", JobStatus::Pending).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn manual_approval_leaves_request_pending() {
        let (ctx, _temp_dir) = setup().await;
        let bob = remote(&ctx).await;
        let alice = local(&ctx, true).await;

        let follow = json!({
            "type": "Follow",
            "uri": "https://remote.example/activities/f2",
            "author": bob.uri,
            "target": alice.uri,
        });
        FollowHandler.handle(&ctx, &bob, follow).await.unwrap();

        let edge = ctx.db.get_relationship(&bob.id, &alice.id).await.unwrap().unwrap();
        assert!(edge.requested);
        assert!(!edge.following);
        assert_eq!(
            ctx.db.count_jobs("delivery", JobStatus::Pending).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn follow_accept_requires_pending_request() {
        let (ctx, _temp_dir) = setup().await;
        let bob = remote(&ctx).await;
        let alice = local(&ctx, false).await;
        let accept = json!({
            "type": "FollowAccept",
            "uri": "https://remote.example/activities/a1",
            "author": bob.uri,
            "target": alice.uri,
        });

        let unsolicited = FollowAcceptHandler.handle(&ctx, &bob, accept.clone()).await;
        assert!(matches!(unsolicited, Err(AppError::Protocol(_))));

        ctx.db
            .apply_follow_transition(&alice.id, &bob.id, FollowTransition::Request)
            .await
            .unwrap();
        FollowAcceptHandler.handle(&ctx, &bob, accept).await.unwrap();

        let edge = ctx.db.get_relationship(&alice.id, &bob.id).await.unwrap().unwrap();
        assert!(edge.following && !edge.requested);
    }

    #[tokio::test]
    async fn unfollow_and_delete_are_scoped_to_signer() {
        let (ctx, _temp_dir) = setup().await;
        let bob = remote(&ctx).await;
        let alice = local(&ctx, false).await;
        ctx.db
            .apply_follow_transition(&bob.id, &alice.id, FollowTransition::Accept)
            .await
            .unwrap();

        let unfollow = json!({
            "type": "Unfollow",
            "uri": "https://remote.example/activities/u1",
            "author": bob.uri,
            "target": alice.uri,
        });
        UnfollowHandler.handle(&ctx, &bob, unfollow).await.unwrap();
        let mirror = ctx.db.get_relationship(&alice.id, &bob.id).await.unwrap().unwrap();
        assert!(!mirror.followed_by);

        let note_uri = "https://remote.example/objects/3";
        NoteHandler
            .handle(&ctx, &bob, note_payload(note_uri, &bob.uri, "bye"))
            .await
            .unwrap();
        let delete = json!({
            "type": "Delete",
            "uri": "https://remote.example/activities/d1",
            "author": bob.uri,
            "target": note_uri,
        });
        DeleteHandler.handle(&ctx, &bob, delete.clone()).await.unwrap();
        DeleteHandler.handle(&ctx, &bob, delete).await.unwrap();
        assert!(ctx.db.get_note_by_uri(note_uri).await.unwrap().is_none());
    }
}
