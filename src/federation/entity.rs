//! Federated entity wire format
//!
//! Entities are JSON objects discriminated by a string `type` tag.
//! Every entity has a canonical `uri`; all but `User` name their
//! `author`, which must be the actor that signed the request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{Actor, Note, Visibility};
use crate::error::AppError;

/// Entity type tags understood by this server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Note,
    Like,
    Follow,
    FollowAccept,
    FollowReject,
    Unfollow,
    Delete,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        Self::User,
        Self::Note,
        Self::Like,
        Self::Follow,
        Self::FollowAccept,
        Self::FollowReject,
        Self::Unfollow,
        Self::Delete,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Note => "Note",
            Self::Like => "Like",
            Self::Follow => "Follow",
            Self::FollowAccept => "FollowAccept",
            Self::FollowReject => "FollowReject",
            Self::Unfollow => "Unfollow",
            Self::Delete => "Delete",
        }
    }
}

/// Actor document served at the actor URI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDocument {
    pub uri: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub inbox: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    /// Base64 Ed25519 verifying key
    pub public_key: String,
    #[serde(default)]
    pub manually_approves_followers: bool,
}

impl UserDocument {
    pub fn from_actor(actor: &Actor) -> Self {
        Self {
            uri: actor.uri.clone(),
            username: actor.username.clone(),
            display_name: actor.display_name.clone(),
            inbox: actor.inbox_url.clone(),
            outbox: actor.outbox_url.clone(),
            public_key: actor.public_key.clone(),
            manually_approves_followers: actor.manually_approves_followers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEntity {
    pub uri: String,
    pub author: String,
    pub content: String,
    pub visibility: Visibility,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies_to: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NoteEntity {
    pub fn from_note(note: &Note, author_uri: &str) -> Self {
        Self {
            uri: note.uri.clone(),
            author: author_uri.to_string(),
            content: note.content.clone(),
            visibility: note.visibility(),
            sensitive: note.is_sensitive,
            replies_to: note.replies_to_uri.clone(),
            created_at: note.created_at,
            updated_at: (note.updated_at != note.created_at).then_some(note.updated_at),
        }
    }
}

/// Entity pointing at another URI: likes, the follow family and deletes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetedEntity {
    pub uri: String,
    pub author: String,
    /// Liked note, followed actor, follower being answered, or deleted entity
    pub target: String,
}

/// Any entity this server sends or receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Entity {
    User(UserDocument),
    Note(NoteEntity),
    Like(TargetedEntity),
    Follow(TargetedEntity),
    FollowAccept(TargetedEntity),
    FollowReject(TargetedEntity),
    Unfollow(TargetedEntity),
    Delete(TargetedEntity),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::User(_) => EntityKind::User,
            Self::Note(_) => EntityKind::Note,
            Self::Like(_) => EntityKind::Like,
            Self::Follow(_) => EntityKind::Follow,
            Self::FollowAccept(_) => EntityKind::FollowAccept,
            Self::FollowReject(_) => EntityKind::FollowReject,
            Self::Unfollow(_) => EntityKind::Unfollow,
            Self::Delete(_) => EntityKind::Delete,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            Self::User(user) => &user.uri,
            Self::Note(note) => &note.uri,
            Self::Like(entity)
            | Self::Follow(entity)
            | Self::FollowAccept(entity)
            | Self::FollowReject(entity)
            | Self::Unfollow(entity)
            | Self::Delete(entity) => &entity.uri,
        }
    }

    /// Actor responsible for the entity
    pub fn author(&self) -> &str {
        match self {
            Self::User(user) => &user.uri,
            Self::Note(note) => &note.author,
            Self::Like(entity)
            | Self::Follow(entity)
            | Self::FollowAccept(entity)
            | Self::FollowReject(entity)
            | Self::Unfollow(entity)
            | Self::Delete(entity) => &entity.author,
        }
    }

    /// Serialized body, exactly as signed and sent
    pub fn to_bytes(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(self).map_err(|e| AppError::Internal(e.into()))
    }
}

/// Type tag and author of a raw inbound payload
#[derive(Debug, Clone)]
pub struct EntityEnvelope {
    pub kind: EntityKind,
    pub uri: String,
    pub author: String,
}

impl EntityEnvelope {
    /// Read the routing fields of a raw payload
    ///
    /// # Errors
    /// `Protocol` for unknown type tags or missing `uri`/`author`
    pub fn inspect(value: &serde_json::Value) -> Result<Self, AppError> {
        let tag = value
            .get("type")
            .and_then(|tag| tag.as_str())
            .ok_or_else(|| AppError::Protocol("Entity has no type tag".to_string()))?;
        let kind = EntityKind::from_tag(tag)
            .ok_or_else(|| AppError::Protocol(format!("Unknown entity type: {}", tag)))?;

        let string_field = |name: &str| {
            value
                .get(name)
                .and_then(|field| field.as_str())
                .map(str::to_string)
                .ok_or_else(|| AppError::Protocol(format!("{} entity has no {}", tag, name)))
        };

        let uri = string_field("uri")?;
        let author = match kind {
            EntityKind::User => uri.clone(),
            _ => string_field("author")?,
        };

        Ok(Self { kind, uri, author })
    }
}

/// Parse a raw payload as the entity struct of one handler
pub fn parse_entity<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    kind: EntityKind,
) -> Result<T, AppError> {
    serde_json::from_value(value)
        .map_err(|e| AppError::Protocol(format!("Malformed {} entity: {}", kind.as_str(), e)))
}

// =============================================================================
// Local URIs
// =============================================================================

pub fn local_actor_uri(base_url: &str, username: &str) -> String {
    format!("{}/users/{}", base_url.trim_end_matches('/'), username)
}

pub fn local_object_uri(base_url: &str, id: &str) -> String {
    format!("{}/objects/{}", base_url.trim_end_matches('/'), id)
}

pub fn local_activity_uri(base_url: &str, id: &str) -> String {
    format!("{}/activities/{}", base_url.trim_end_matches('/'), id)
}

/// Authority (`host[:port]`) of a URI, lowercased
pub fn uri_authority(uri: &str) -> Option<String> {
    let parsed = url::Url::parse(uri).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}
