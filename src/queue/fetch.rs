//! Fetch/refetch queue
//!
//! Background retrieval of remote state: actor documents (first fetch or
//! refresh of a stale shadow row) and instance NodeInfo. A periodic sweep
//! queues refreshes for remote actors older than the actor TTL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{JobError, JobHandler, JobQueue, QueueKind};
use crate::config::QueueConfig;
use crate::data::{Database, Job};
use crate::error::AppError;
use crate::federation::entity::uri_authority;
use crate::federation::{EntityResolver, FederationClient, nodeinfo};

const STALE_SWEEP_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchPayload {
    User { uri: String },
    Instance { domain: String },
}

/// Producer side of the fetch queue
#[derive(Clone)]
pub struct FetchQueue {
    queue: JobQueue,
    db: Arc<Database>,
}

impl FetchQueue {
    pub fn new(db: Arc<Database>, settings: QueueConfig) -> Self {
        Self {
            queue: JobQueue::new(QueueKind::Fetch, db.clone(), settings),
            db,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub async fn enqueue_user(&self, uri: &str) -> Result<Job, AppError> {
        self.queue
            .push(&FetchPayload::User {
                uri: uri.to_string(),
            })
            .await
    }

    pub async fn enqueue_instance(&self, domain: &str) -> Result<Job, AppError> {
        self.queue
            .push(&FetchPayload::Instance {
                domain: domain.to_ascii_lowercase(),
            })
            .await
    }

    /// Queue refreshes for remote actors not fetched within `ttl`
    ///
    /// # Returns
    /// Number of refreshes queued
    pub async fn enqueue_stale_actors(&self, ttl: Duration) -> Result<usize, AppError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| AppError::Internal(e.into()))?;
        let cutoff = Utc::now() - ttl;
        let uris = self
            .db
            .get_stale_remote_actor_uris(cutoff, STALE_SWEEP_BATCH)
            .await?;

        for uri in &uris {
            self.enqueue_user(uri).await?;
        }
        if !uris.is_empty() {
            tracing::info!(count = uris.len(), "Queued stale actor refreshes");
        }
        Ok(uris.len())
    }
}

/// Consumer side of the fetch queue
pub struct FetchWorker {
    db: Arc<Database>,
    resolver: Arc<EntityResolver>,
    client: Arc<FederationClient>,
    fetch: FetchQueue,
    scheme: String,
}

impl FetchWorker {
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<EntityResolver>,
        client: Arc<FederationClient>,
        fetch: FetchQueue,
        scheme: impl Into<String>,
    ) -> Self {
        Self {
            db,
            resolver,
            client,
            fetch,
            scheme: scheme.into(),
        }
    }

    async fn fetch_user(&self, uri: &str) -> Result<(), JobError> {
        let actor = match self.db.get_actor_by_uri(uri).await? {
            Some(actor) if !actor.is_remote => return Ok(()),
            Some(_) => self.resolver.refresh(uri).await.map_err(|error| match error {
                AppError::NotFound => JobError::Rejected(format!("Actor {} is gone", uri)),
                other => JobError::from(other),
            })?,
            None => self
                .resolver
                .resolve(uri)
                .await?
                .ok_or_else(|| JobError::Rejected(format!("Actor {} is unresolvable", uri)))?,
        };

        let domain = actor.domain.clone().or_else(|| uri_authority(uri));
        if let Some(domain) = domain {
            if self.db.get_instance_by_domain(&domain).await?.is_none() {
                self.fetch.enqueue_instance(&domain).await?;
            }
        }
        Ok(())
    }

    async fn fetch_instance(&self, domain: &str) -> Result<(), JobError> {
        let instance = nodeinfo::discover(&self.client, &self.scheme, domain)
            .await
            .map_err(|error| match error {
                AppError::NotFound => {
                    JobError::Rejected(format!("{} serves no NodeInfo", domain))
                }
                other => JobError::from(other),
            })?;

        self.db.upsert_instance(&instance).await?;
        tracing::info!(
            %domain,
            software = instance.software_name.as_deref().unwrap_or("unknown"),
            "Instance metadata updated"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for FetchWorker {
    async fn run(&self, job: &Job) -> Result<(), JobError> {
        let payload: FetchPayload = serde_json::from_str(&job.payload)
            .map_err(|e| JobError::Permanent(format!("Unreadable fetch job: {}", e)))?;

        match payload {
            FetchPayload::User { uri } => self.fetch_user(&uri).await,
            FetchPayload::Instance { domain } => self.fetch_instance(&domain).await,
        }
    }
}

/// Spawn the periodic staleness sweep
pub fn spawn_stale_sweep(
    fetch: FetchQueue,
    resolver: Arc<EntityResolver>,
    ttl: Duration,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(error) = fetch.enqueue_stale_actors(ttl).await {
                tracing::warn!(%error, "Stale actor sweep failed");
            }
            resolver.prune_cooldown().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Actor, EntityId, JobStatus};
    use tempfile::TempDir;

    #[test]
    fn payload_is_tagged() {
        let value = serde_json::to_value(FetchPayload::Instance {
            domain: "remote.example".to_string(),
        })
        .unwrap();
        assert_eq!(value["kind"], "instance");
        assert_eq!(value["domain"], "remote.example");
    }

    #[tokio::test]
    async fn sweep_queues_only_stale_actors() {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("f.db")).await.unwrap());
        let fetch = FetchQueue::new(db.clone(), QueueConfig::default());

        let now = Utc::now();
        for (name, fetched_at) in [
            ("fresh", now),
            ("stale", now - chrono::Duration::days(3)),
        ] {
            db.upsert_remote_actor(&Actor {
                id: EntityId::new().0,
                uri: format!("https://remote.example/users/{name}"),
                username: name.to_string(),
                domain: Some("remote.example".to_string()),
                display_name: None,
                inbox_url: format!("https://remote.example/users/{name}/inbox"),
                outbox_url: None,
                public_key: "key".to_string(),
                private_key: None,
                is_remote: true,
                manually_approves_followers: false,
                last_fetched_at: Some(fetched_at),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        }

        let queued = fetch
            .enqueue_stale_actors(Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(queued, 1);
        assert_eq!(db.count_jobs("fetch", JobStatus::Pending).await.unwrap(), 1);
    }
}
