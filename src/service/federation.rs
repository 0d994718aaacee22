//! Federation service
//!
//! Local actions that produce outbound entities: registering actors,
//! posting and deleting notes, likes and the follow lifecycle. Each action
//! commits locally first and then queues deliveries; it never waits on a
//! remote server.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{
    Actor, Database, EntityId, FollowTransition, Like, Note, Relationship, Visibility,
};
use crate::error::AppError;
use crate::federation::entity::{
    local_activity_uri, local_actor_uri, local_object_uri,
};
use crate::federation::signature::generate_keypair;
use crate::federation::{Entity, EntityResolver, NoteEntity, TargetedEntity};
use crate::queue::DeliveryQueue;

const MAX_USERNAME_LEN: usize = 30;
const MAX_NOTE_LEN: usize = 5_000;

fn validate_username(username: &str) -> Result<(), AppError> {
    let valid = !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(AppError::Validation(
            "username must be 1-30 characters of a-z, 0-9 or _".to_string(),
        ));
    }
    Ok(())
}

fn require_local(actor: &Actor) -> Result<(), AppError> {
    if actor.is_remote {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

pub struct FederationService {
    db: Arc<Database>,
    resolver: Arc<EntityResolver>,
    delivery: DeliveryQueue,
    base_url: String,
}

impl FederationService {
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<EntityResolver>,
        delivery: DeliveryQueue,
        base_url: String,
    ) -> Self {
        Self {
            db,
            resolver,
            delivery,
            base_url,
        }
    }

    /// Create a local actor with a fresh Ed25519 keypair
    ///
    /// # Errors
    /// `Validation` for malformed or taken usernames
    pub async fn register_local_actor(
        &self,
        username: &str,
        display_name: Option<String>,
        manually_approves_followers: bool,
    ) -> Result<Actor, AppError> {
        validate_username(username)?;

        let uri = local_actor_uri(&self.base_url, username);
        let (private_key, public_key) = generate_keypair();
        let now = Utc::now();
        let actor = Actor {
            id: EntityId::new().0,
            inbox_url: format!("{}/inbox", uri),
            outbox_url: Some(format!("{}/outbox", uri)),
            uri,
            username: username.to_string(),
            domain: None,
            display_name,
            public_key,
            private_key: Some(private_key),
            is_remote: false,
            manually_approves_followers,
            last_fetched_at: None,
            created_at: now,
            updated_at: now,
        };

        if !self.db.insert_local_actor(&actor).await? {
            return Err(AppError::Validation(format!(
                "username {} is already taken",
                username
            )));
        }

        tracing::info!(%username, uri = %actor.uri, "Local actor registered");
        Ok(actor)
    }

    /// Publish a note and fan it out to followers
    ///
    /// Direct notes are stored but never fanned out.
    pub async fn create_note(
        &self,
        author: &Actor,
        content: &str,
        visibility: Visibility,
        replies_to: Option<String>,
    ) -> Result<Note, AppError> {
        require_local(author)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("note content is required".to_string()));
        }
        if content.chars().count() > MAX_NOTE_LEN {
            return Err(AppError::Validation(format!(
                "note content exceeds {} characters",
                MAX_NOTE_LEN
            )));
        }

        let id = EntityId::new().0;
        let now = Utc::now();
        let note = Note {
            uri: local_object_uri(&self.base_url, &id),
            id,
            author_id: author.id.clone(),
            content: format!("<p>{}</p>", ammonia::clean_text(content)),
            visibility: visibility.as_str().to_string(),
            is_sensitive: false,
            replies_to_uri: replies_to,
            is_local: true,
            created_at: now,
            updated_at: now,
        };
        self.db.upsert_note(&note).await?;

        if visibility != Visibility::Direct {
            let entity = Entity::Note(NoteEntity::from_note(&note, &author.uri));
            self.delivery.federate_to_followers(&entity, author).await?;
        }

        Ok(note)
    }

    /// Remove an own note and announce the deletion
    pub async fn delete_note(&self, author: &Actor, note_uri: &str) -> Result<(), AppError> {
        require_local(author)?;
        if !self.db.delete_note_by_uri(note_uri, &author.id).await? {
            return Err(AppError::NotFound);
        }

        let entity = Entity::Delete(TargetedEntity {
            uri: local_activity_uri(&self.base_url, &EntityId::new().0),
            author: author.uri.clone(),
            target: note_uri.to_string(),
        });
        self.delivery.federate_to_followers(&entity, author).await?;
        Ok(())
    }

    /// Like a note, notifying its remote author
    pub async fn like(&self, author: &Actor, note_uri: &str) -> Result<Like, AppError> {
        require_local(author)?;
        let note = self
            .db
            .get_note_by_uri(note_uri)
            .await?
            .ok_or(AppError::NotFound)?;

        let like = Like {
            id: EntityId::new().0,
            uri: local_activity_uri(&self.base_url, &EntityId::new().0),
            author_id: author.id.clone(),
            liked_uri: note.uri.clone(),
            created_at: Utc::now(),
        };
        self.db.insert_like_if_absent(&like).await?;

        if let Some(note_author) = self.db.get_actor(&note.author_id).await? {
            if note_author.is_remote {
                let entity = Entity::Like(TargetedEntity {
                    uri: like.uri.clone(),
                    author: author.uri.clone(),
                    target: note.uri.clone(),
                });
                self.delivery
                    .federate_entity(&entity, author, &note_author.uri)
                    .await?;
            }
        }

        Ok(like)
    }

    /// Follow an actor by URI
    ///
    /// Local followees apply their approval policy at once; remote ones get
    /// a pending request and a `Follow` delivery.
    ///
    /// # Errors
    /// `NotFound` if the target cannot be resolved
    pub async fn follow(&self, follower: &Actor, target_uri: &str) -> Result<Relationship, AppError> {
        require_local(follower)?;
        let followee = self
            .resolver
            .resolve(target_uri)
            .await?
            .ok_or(AppError::NotFound)?;
        if followee.id == follower.id {
            return Err(AppError::Validation("cannot follow yourself".to_string()));
        }

        let transition = if !followee.is_remote && !followee.manually_approves_followers {
            FollowTransition::Accept
        } else {
            FollowTransition::Request
        };
        self.db
            .apply_follow_transition(&follower.id, &followee.id, transition)
            .await?;

        if followee.is_remote {
            let entity = Entity::Follow(TargetedEntity {
                uri: local_activity_uri(&self.base_url, &EntityId::new().0),
                author: follower.uri.clone(),
                target: followee.uri.clone(),
            });
            self.delivery
                .federate_entity(&entity, follower, &followee.uri)
                .await?;
        }

        self.relationship(&follower.id, &followee.id).await
    }

    pub async fn unfollow(&self, follower: &Actor, target_uri: &str) -> Result<(), AppError> {
        require_local(follower)?;
        let followee = self
            .db
            .get_actor_by_uri(target_uri)
            .await?
            .ok_or(AppError::NotFound)?;

        self.db
            .apply_follow_transition(&follower.id, &followee.id, FollowTransition::Unfollow)
            .await?;

        if followee.is_remote {
            let entity = Entity::Unfollow(TargetedEntity {
                uri: local_activity_uri(&self.base_url, &EntityId::new().0),
                author: follower.uri.clone(),
                target: followee.uri.clone(),
            });
            self.delivery
                .federate_entity(&entity, follower, &followee.uri)
                .await?;
        }
        Ok(())
    }

    /// Approve or reject a pending follow request towards `followee`
    pub async fn answer_follow_request(
        &self,
        followee: &Actor,
        follower_uri: &str,
        accept: bool,
    ) -> Result<(), AppError> {
        require_local(followee)?;
        let follower = self
            .db
            .get_actor_by_uri(follower_uri)
            .await?
            .ok_or(AppError::NotFound)?;

        let pending = self
            .db
            .get_relationship(&follower.id, &followee.id)
            .await?
            .is_some_and(|edge| edge.requested);
        if !pending {
            return Err(AppError::NotFound);
        }

        let (transition, entity) = if accept {
            (
                FollowTransition::Accept,
                Entity::FollowAccept(TargetedEntity {
                    uri: local_activity_uri(&self.base_url, &EntityId::new().0),
                    author: followee.uri.clone(),
                    target: follower.uri.clone(),
                }),
            )
        } else {
            (
                FollowTransition::Reject,
                Entity::FollowReject(TargetedEntity {
                    uri: local_activity_uri(&self.base_url, &EntityId::new().0),
                    author: followee.uri.clone(),
                    target: follower.uri.clone(),
                }),
            )
        };

        self.db
            .apply_follow_transition(&follower.id, &followee.id, transition)
            .await?;
        if follower.is_remote {
            self.delivery
                .federate_entity(&entity, followee, &follower.uri)
                .await?;
        }
        Ok(())
    }

    async fn relationship(&self, owner_id: &str, subject_id: &str) -> Result<Relationship, AppError> {
        self.db
            .get_relationship(owner_id, subject_id)
            .await?
            .ok_or(AppError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::data::JobStatus;
    use crate::federation::{FederationClient, SigningIdentity};
    use crate::queue::DeliveryPayload;
    use std::time::Duration;
    use tempfile::TempDir;

    const BASE: &str = "https://local.example";

    async fn service() -> (FederationService, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("s.db")).await.unwrap());
        let config = crate::config::tests::valid_config();
        let client = Arc::new(FederationClient::new(&config.federation).unwrap());
        let (private_key, _) = generate_keypair();
        let signer = Arc::new(
            SigningIdentity::new(local_actor_uri(BASE, "actor"), &private_key).unwrap(),
        );
        let resolver = Arc::new(EntityResolver::new(
            db.clone(),
            client,
            signer,
            Duration::from_secs(86_400),
            Duration::from_secs(60),
            "https",
        ));
        let delivery = DeliveryQueue::new(db.clone(), QueueConfig::default());
        (
            FederationService::new(db.clone(), resolver, delivery, BASE.to_string()),
            db,
            temp_dir,
        )
    }

    async fn remote_bob(db: &Database) -> Actor {
        let (_, public_key) = generate_keypair();
        let now = Utc::now();
        db.upsert_remote_actor(&Actor {
            id: EntityId::new().0,
            uri: "https://remote.example/users/bob".to_string(),
            username: "bob".to_string(),
            domain: Some("remote.example".to_string()),
            display_name: None,
            inbox_url: "https://remote.example/users/bob/inbox".to_string(),
            outbox_url: None,
            public_key,
            private_key: None,
            is_remote: true,
            manually_approves_followers: false,
            last_fetched_at: Some(now),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn registration_rejects_duplicates_and_bad_names() {
        let (service, _db, _temp_dir) = service().await;
        let alice = service.register_local_actor("alice", None, false).await.unwrap();
        assert_eq!(alice.uri, "https://local.example/users/alice");
        assert!(alice.private_key.is_some());

        assert!(matches!(
            service.register_local_actor("alice", None, false).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            service.register_local_actor("Not Valid", None, false).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn note_fans_out_to_remote_followers() {
        let (service, db, _temp_dir) = service().await;
        let alice = service.register_local_actor("alice", None, false).await.unwrap();
        let bob = remote_bob(&db).await;
        db.apply_follow_transition(&bob.id, &alice.id, FollowTransition::Accept)
            .await
            .unwrap();

        let note = service
            .create_note(&alice, "hello <b>world</b>", Visibility::Public, None)
            .await
            .unwrap();
        assert!(note.content.contains("&lt;b&gt;"));

        service
            .create_note(&alice, "just for me", Visibility::Direct, None)
            .await
            .unwrap();
        assert_eq!(db.count_jobs("delivery", JobStatus::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn following_a_remote_actor_sends_a_request() {
        let (service, db, _temp_dir) = service().await;
        let alice = service.register_local_actor("alice", None, false).await.unwrap();
        let bob = remote_bob(&db).await;

        let edge = service.follow(&alice, &bob.uri).await.unwrap();
        assert!(edge.requested);
        assert!(!edge.following);

        let job = db
            .claim_job("delivery", crate::queue::now_ms(), 1_000)
            .await
            .unwrap()
            .unwrap();
        let payload: DeliveryPayload = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(payload.recipient_uri, bob.uri);
        assert!(matches!(payload.entity, Entity::Follow(_)));
    }

    #[tokio::test]
    async fn manual_approval_flow() {
        let (service, db, _temp_dir) = service().await;
        let alice = service.register_local_actor("alice", None, true).await.unwrap();
        let bob = remote_bob(&db).await;
        db.apply_follow_transition(&bob.id, &alice.id, FollowTransition::Request)
            .await
            .unwrap();

        service
            .answer_follow_request(&alice, &bob.uri, true)
            .await
            .unwrap();

        let edge = db.get_relationship(&bob.id, &alice.id).await.unwrap().unwrap();
        assert!(edge.following);
        assert!(matches!(
            service.answer_follow_request(&alice, &bob.uri, true).await,
            Err(AppError::NotFound)
        ));
    }
}
