//! Data models
//!
//! Rust structs representing database rows.
//! All models use ULID for IDs and chrono for timestamps.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

lazy_static! {
    static ref ULID_GENERATOR: Mutex<ulid::Generator> = Mutex::new(ulid::Generator::new());
}

/// Entity ID wrapper (ULID format, 26 characters)
///
/// IDs minted by one process are strictly increasing, so the `id` column
/// doubles as the pagination sort key.
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new monotonic ULID
    pub fn new() -> Self {
        let generated = ULID_GENERATOR
            .lock()
            .ok()
            .and_then(|mut generator| generator.generate().ok());
        Self(generated.unwrap_or_else(ulid::Ulid::new).to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Actors
// =============================================================================

/// A local account or the shadow copy of a remote actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// Canonical actor URI (globally unique)
    pub uri: String,
    pub username: String,
    /// Host of a remote actor, None for local accounts
    pub domain: Option<String>,
    pub display_name: Option<String>,
    pub inbox_url: String,
    pub outbox_url: Option<String>,
    /// Ed25519 verifying key (base64)
    pub public_key: String,
    /// Ed25519 signing key seed (base64), local accounts only
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    pub is_remote: bool,
    pub manually_approves_followers: bool,
    /// When the remote document was last fetched
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// `user@domain` handle, with the local domain filled in for local accounts
    pub fn handle(&self, local_domain: &str) -> String {
        format!(
            "{}@{}",
            self.username,
            self.domain.as_deref().unwrap_or(local_domain)
        )
    }
}

/// Remote server metadata discovered through NodeInfo
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub id: String,
    pub domain: String,
    pub base_url: String,
    pub software_name: Option<String>,
    pub software_version: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Federated entities
// =============================================================================

/// Note visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Followers,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Followers => "followers",
            Self::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Self::Public),
            "unlisted" => Some(Self::Unlisted),
            "followers" => Some(Self::Followers),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }

    /// Visible to unauthenticated fetches (object endpoint, outbox)
    pub fn is_publicly_fetchable(&self) -> bool {
        matches!(self, Self::Public | Self::Unlisted)
    }
}

/// A post, local or received from a remote instance
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: String,
    /// Canonical URI (globally unique)
    pub uri: String,
    pub author_id: String,
    /// Sanitized HTML content
    pub content: String,
    /// Values: public, unlisted, followers, direct
    pub visibility: String,
    pub is_sensitive: bool,
    pub replies_to_uri: Option<String>,
    pub is_local: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn visibility(&self) -> Visibility {
        Visibility::parse(&self.visibility).unwrap_or(Visibility::Direct)
    }
}

/// A like of a note, identified by its own URI
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Like {
    pub id: String,
    pub uri: String,
    pub author_id: String,
    pub liked_uri: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Relationships
// =============================================================================

/// Directional facets of the edge from `owner_id` to `subject_id`
///
/// `following`: owner follows subject.
/// `requested`: owner asked to follow subject, awaiting approval.
/// `followed_by`: subject follows owner.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relationship {
    pub id: String,
    pub owner_id: String,
    pub subject_id: String,
    pub following: bool,
    pub requested: bool,
    pub followed_by: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Follow lifecycle mutations applied to an (A, B) edge pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowTransition {
    /// A asked to follow B, awaiting approval
    Request,
    /// A follows B (auto-accepted or approved)
    Accept,
    /// B rejected A's request, or removed A as follower
    Reject,
    /// A stopped following B
    Unfollow,
}

// =============================================================================
// Jobs
// =============================================================================

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Terminal failure without retries
    Failed,
    /// Terminal failure after retries, or a permanent protocol error
    DeadLettered,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::DeadLettered)
    }
}

/// A durable queue job
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    /// Values: inbox, delivery, fetch
    pub queue: String,
    /// JSON payload, shape depends on the queue
    pub payload: String,
    pub status: String,
    /// Queue-specific progress label
    pub stage: Option<String>,
    /// Number of claims so far, including the running one
    pub attempts: i64,
    pub max_attempts: i64,
    /// Earliest claim time (unix milliseconds)
    pub run_at: i64,
    /// Lease expiry of a running job (unix milliseconds)
    pub locked_until: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_are_strictly_increasing() {
        let ids: Vec<EntityId> = (0..64).map(|_| EntityId::new()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(ids.iter().all(|id| id.0.len() == 26));
    }

    #[test]
    fn visibility_round_trips_through_strings() {
        for visibility in [
            Visibility::Public,
            Visibility::Unlisted,
            Visibility::Followers,
            Visibility::Direct,
        ] {
            assert_eq!(Visibility::parse(visibility.as_str()), Some(visibility));
        }
        assert!(Visibility::Unlisted.is_publicly_fetchable());
        assert!(!Visibility::Followers.is_publicly_fetchable());
    }

    #[test]
    fn job_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert_eq!(JobStatus::parse("dead_lettered"), Some(JobStatus::DeadLettered));
    }
}
