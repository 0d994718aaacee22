//! SQLite database operations
//!
//! All database access goes through this module.
//! Remote entities are keyed by their unique URI and written with
//! conflict-tolerant upserts; queue jobs are claimed with a single
//! `UPDATE ... RETURNING` statement.
//!
//! SQLite only commits a `RETURNING` statement once every row has been
//! stepped, so writes that return rows are drained with `fetch_all`.
//! Job state transitions are fenced on `attempts`: a worker whose lease
//! was reclaimed cannot overwrite the newer attempt's outcome.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Underlying pool, for query builders such as the paginator
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Get actor by local ID
    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Get actor by canonical URI
    pub async fn get_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM users WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Get a local account by username
    pub async fn get_local_actor_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM users WHERE username = ? AND is_remote = 0",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Insert a local account
    ///
    /// # Returns
    /// `true` if inserted, `false` if the username or URI was already taken.
    pub async fn insert_local_actor(&self, actor: &Actor) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO users (
                id, uri, username, domain, display_name, inbox_url, outbox_url,
                public_key, private_key, is_remote, manually_approves_followers,
                last_fetched_at, created_at, updated_at
            ) VALUES (?, ?, ?, NULL, ?, ?, ?, ?, ?, 0, ?, NULL, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.display_name)
        .bind(&actor.inbox_url)
        .bind(&actor.outbox_url)
        .bind(&actor.public_key)
        .bind(&actor.private_key)
        .bind(actor.manually_approves_followers)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Insert or update the shadow copy of a remote actor
    ///
    /// Concurrent first resolutions of one URI converge on a single row.
    /// A local account sharing the URI is never overwritten.
    ///
    /// # Returns
    /// The stored row after the write.
    pub async fn upsert_remote_actor(&self, actor: &Actor) -> Result<Actor, AppError> {
        let stored = sqlx::query_as::<_, Actor>(
            r#"
            INSERT INTO users (
                id, uri, username, domain, display_name, inbox_url, outbox_url,
                public_key, private_key, is_remote, manually_approves_followers,
                last_fetched_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, 1, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                username = excluded.username,
                domain = excluded.domain,
                display_name = excluded.display_name,
                inbox_url = excluded.inbox_url,
                outbox_url = excluded.outbox_url,
                public_key = excluded.public_key,
                manually_approves_followers = excluded.manually_approves_followers,
                last_fetched_at = excluded.last_fetched_at,
                updated_at = excluded.updated_at
            WHERE users.is_remote = 1
            RETURNING *
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.display_name)
        .bind(&actor.inbox_url)
        .bind(&actor.outbox_url)
        .bind(&actor.public_key)
        .bind(actor.manually_approves_followers)
        .bind(actor.last_fetched_at)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next();

        match stored {
            Some(stored) => Ok(stored),
            None => self
                .get_actor_by_uri(&actor.uri)
                .await?
                .ok_or(AppError::NotFound),
        }
    }

    /// Refresh a known remote actor in place
    ///
    /// Strictly an `UPDATE` of the existing row; never inserts.
    ///
    /// # Returns
    /// `true` if a remote row with this URI existed and was updated.
    pub async fn update_remote_actor(&self, actor: &Actor) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                username = ?, domain = ?, display_name = ?, inbox_url = ?,
                outbox_url = ?, public_key = ?, manually_approves_followers = ?,
                last_fetched_at = ?, updated_at = ?
            WHERE uri = ? AND is_remote = 1
            "#,
        )
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.display_name)
        .bind(&actor.inbox_url)
        .bind(&actor.outbox_url)
        .bind(&actor.public_key)
        .bind(actor.manually_approves_followers)
        .bind(actor.last_fetched_at)
        .bind(actor.updated_at)
        .bind(&actor.uri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// URIs of remote actors not fetched since `cutoff`
    pub async fn get_stale_remote_actor_uris(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, AppError> {
        let uris = sqlx::query_scalar::<_, String>(
            r#"
            SELECT uri FROM users
            WHERE is_remote = 1 AND (last_fetched_at IS NULL OR last_fetched_at < ?)
            ORDER BY last_fetched_at
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(uris)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Insert or refresh instance metadata keyed by domain
    pub async fn upsert_instance(&self, instance: &Instance) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO instances (
                id, domain, base_url, software_name, software_version,
                last_fetched_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET
                base_url = excluded.base_url,
                software_name = excluded.software_name,
                software_version = excluded.software_version,
                last_fetched_at = excluded.last_fetched_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.domain)
        .bind(&instance.base_url)
        .bind(&instance.software_name)
        .bind(&instance.software_version)
        .bind(instance.last_fetched_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_instance_by_domain(&self, domain: &str) -> Result<Option<Instance>, AppError> {
        let instance = sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;

        Ok(instance)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    pub async fn get_note(&self, id: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(note)
    }

    pub async fn get_note_by_uri(&self, uri: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(note)
    }

    /// Insert a note or update the stored copy with the same URI
    ///
    /// An existing row owned by a different author is left untouched.
    ///
    /// # Returns
    /// `false` if the URI belongs to another author.
    pub async fn upsert_note(&self, note: &Note) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notes (
                id, uri, author_id, content, visibility, is_sensitive,
                replies_to_uri, is_local, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                content = excluded.content,
                visibility = excluded.visibility,
                is_sensitive = excluded.is_sensitive,
                replies_to_uri = excluded.replies_to_uri,
                updated_at = excluded.updated_at
            WHERE notes.author_id = excluded.author_id
            "#,
        )
        .bind(&note.id)
        .bind(&note.uri)
        .bind(&note.author_id)
        .bind(&note.content)
        .bind(&note.visibility)
        .bind(note.is_sensitive)
        .bind(&note.replies_to_uri)
        .bind(note.is_local)
        .bind(note.created_at)
        .bind(note.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a note, scoped to its author
    pub async fn delete_note_by_uri(&self, uri: &str, author_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM notes WHERE uri = ? AND author_id = ?")
            .bind(uri)
            .bind(author_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Likes
    // =========================================================================

    pub async fn get_like_by_uri(&self, uri: &str) -> Result<Option<Like>, AppError> {
        let like = sqlx::query_as::<_, Like>("SELECT * FROM likes WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(like)
    }

    /// Insert a like once per URI
    ///
    /// # Returns
    /// `true` if the row was new.
    pub async fn insert_like_if_absent(&self, like: &Like) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO likes (id, uri, author_id, liked_uri, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO NOTHING
            "#,
        )
        .bind(&like.id)
        .bind(&like.uri)
        .bind(&like.author_id)
        .bind(&like.liked_uri)
        .bind(like.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a like, scoped to its author
    pub async fn delete_like_by_uri(&self, uri: &str, author_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM likes WHERE uri = ? AND author_id = ?")
            .bind(uri)
            .bind(author_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_likes_of(&self, liked_uri: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM likes WHERE liked_uri = ?")
            .bind(liked_uri)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    pub async fn get_relationship(
        &self,
        owner_id: &str,
        subject_id: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let relationship = sqlx::query_as::<_, Relationship>(
            "SELECT * FROM relationships WHERE owner_id = ? AND subject_id = ?",
        )
        .bind(owner_id)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relationship)
    }

    pub async fn count_relationships(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM relationships")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Apply a follow lifecycle step from `follower_id` towards `followee_id`
    ///
    /// The (follower, followee) edge and its mirror (followee, follower) are
    /// written in one transaction so `following` and `followed_by` never
    /// disagree.
    pub async fn apply_follow_transition(
        &self,
        follower_id: &str,
        followee_id: &str,
        transition: FollowTransition,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        match transition {
            FollowTransition::Request => {
                upsert_edge(&mut tx, follower_id, followee_id, Some(false), Some(true), None, now)
                    .await?;
            }
            FollowTransition::Accept => {
                upsert_edge(&mut tx, follower_id, followee_id, Some(true), Some(false), None, now)
                    .await?;
                upsert_edge(&mut tx, followee_id, follower_id, None, None, Some(true), now)
                    .await?;
            }
            FollowTransition::Reject | FollowTransition::Unfollow => {
                clear_edge(&mut tx, follower_id, followee_id, now).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Actors with an accepted follow towards `actor_id`
    pub async fn get_followers(&self, actor_id: &str) -> Result<Vec<Actor>, AppError> {
        let followers = sqlx::query_as::<_, Actor>(
            r#"
            SELECT users.* FROM relationships
            JOIN users ON users.id = relationships.subject_id
            WHERE relationships.owner_id = ? AND relationships.followed_by = 1
            ORDER BY users.id
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Append a pending job
    pub async fn push_job(
        &self,
        queue: &str,
        payload: &str,
        max_attempts: u32,
        run_at_ms: i64,
    ) -> Result<Job, AppError> {
        let now = Utc::now();
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, queue, payload, status, stage, attempts, max_attempts,
                run_at, locked_until, last_error, created_at, updated_at
            ) VALUES (?, ?, ?, 'pending', NULL, 0, ?, ?, NULL, NULL, ?, ?)
            RETURNING *
            "#,
        )
        .bind(EntityId::new().0)
        .bind(queue)
        .bind(payload)
        .bind(max_attempts as i64)
        .bind(run_at_ms)
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("job insert returned no row")))?;

        Ok(job)
    }

    /// Atomically claim the next runnable job of a queue
    ///
    /// Runnable means pending and due, or running with an expired lease.
    /// The claim increments `attempts` and leases the job until
    /// `now_ms + lease_ms`.
    pub async fn claim_job(
        &self,
        queue: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<Job>, AppError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = 'running',
                attempts = attempts + 1,
                locked_until = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?
                  AND (
                    (status = 'pending' AND run_at <= ?)
                    OR (status = 'running' AND locked_until < ?)
                  )
                ORDER BY run_at, id
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now_ms + lease_ms)
        .bind(Utc::now())
        .bind(queue)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next();

        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, AppError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    /// Record queue-specific progress of a running job
    ///
    /// # Returns
    /// `false` when `attempt` no longer holds the job.
    pub async fn set_job_stage(
        &self,
        id: &str,
        attempt: i64,
        stage: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE jobs SET stage = ?, updated_at = ? WHERE id = ? AND attempts = ? AND status = 'running'",
        )
        .bind(stage)
        .bind(Utc::now())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a job to a terminal status
    ///
    /// # Returns
    /// `false` when `attempt` no longer holds the job.
    pub async fn finish_job(
        &self,
        id: &str,
        attempt: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?, last_error = ?, locked_until = NULL, updated_at = ?
            WHERE id = ? AND attempts = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release a job back to pending, runnable again at `run_at_ms`
    ///
    /// # Returns
    /// `false` when `attempt` no longer holds the job.
    pub async fn retry_job(
        &self,
        id: &str,
        attempt: i64,
        error: &str,
        run_at_ms: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'pending', last_error = ?, run_at = ?, locked_until = NULL, updated_at = ?
            WHERE id = ? AND attempts = ? AND status = 'running'
            "#,
        )
        .bind(error)
        .bind(run_at_ms)
        .bind(Utc::now())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_jobs(&self, queue: &str, status: JobStatus) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE queue = ? AND status = ?")
                .bind(queue)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

async fn upsert_edge(
    conn: &mut SqliteConnection,
    owner_id: &str,
    subject_id: &str,
    following: Option<bool>,
    requested: Option<bool>,
    followed_by: Option<bool>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO relationships (
            id, owner_id, subject_id, following, requested, followed_by, created_at, updated_at
        ) VALUES (?, ?, ?, COALESCE(?, 0), COALESCE(?, 0), COALESCE(?, 0), ?, ?)
        ON CONFLICT(owner_id, subject_id) DO UPDATE SET
            following = COALESCE(?, relationships.following),
            requested = COALESCE(?, relationships.requested),
            followed_by = COALESCE(?, relationships.followed_by),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(EntityId::new().0)
    .bind(owner_id)
    .bind(subject_id)
    .bind(following)
    .bind(requested)
    .bind(followed_by)
    .bind(now)
    .bind(now)
    .bind(following)
    .bind(requested)
    .bind(followed_by)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn clear_edge(
    conn: &mut SqliteConnection,
    follower_id: &str,
    followee_id: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE relationships SET following = 0, requested = 0, updated_at = ?
        WHERE owner_id = ? AND subject_id = ?
        "#,
    )
    .bind(now)
    .bind(follower_id)
    .bind(followee_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE relationships SET followed_by = 0, updated_at = ?
        WHERE owner_id = ? AND subject_id = ?
        "#,
    )
    .bind(now)
    .bind(followee_id)
    .bind(follower_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
