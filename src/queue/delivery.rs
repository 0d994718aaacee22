//! Delivery queue
//!
//! One job per (entity, recipient). The worker resolves the recipient's
//! inbox, signs the serialized entity as the sending local actor and POSTs
//! it. 2xx completes the job; 408, 429, 5xx and network failures are
//! retried with backoff; any other status, an unresolvable recipient or a
//! refused target fails the job immediately.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{JobError, JobHandler, JobQueue, QueueKind};
use crate::config::QueueConfig;
use crate::data::{Actor, Database, Job};
use crate::error::AppError;
use crate::federation::client::is_retryable_status;
use crate::federation::{Entity, EntityResolver, FederationClient, SigningIdentity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPayload {
    /// Local actor id of the sender
    pub sender_id: String,
    pub recipient_uri: String,
    pub entity: Entity,
}

/// Producer side of the delivery queue
#[derive(Clone)]
pub struct DeliveryQueue {
    queue: JobQueue,
    db: Arc<Database>,
}

impl DeliveryQueue {
    pub fn new(db: Arc<Database>, settings: QueueConfig) -> Self {
        Self {
            queue: JobQueue::new(QueueKind::Delivery, db.clone(), settings),
            db,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Queue `entity` for one recipient
    ///
    /// # Errors
    /// `Forbidden` if `sender` is not a local actor
    pub async fn federate_entity(
        &self,
        entity: &Entity,
        sender: &Actor,
        recipient_uri: &str,
    ) -> Result<Job, AppError> {
        if sender.is_remote {
            return Err(AppError::Forbidden);
        }

        let job = self
            .queue
            .push(&DeliveryPayload {
                sender_id: sender.id.clone(),
                recipient_uri: recipient_uri.to_string(),
                entity: entity.clone(),
            })
            .await?;

        tracing::debug!(
            kind = entity.kind().as_str(),
            recipient = %recipient_uri,
            job_id = %job.id,
            "Delivery queued"
        );
        Ok(job)
    }

    /// Queue `entity` for every remote follower of `sender`
    ///
    /// # Returns
    /// The queued jobs, one per remote follower
    pub async fn federate_to_followers(
        &self,
        entity: &Entity,
        sender: &Actor,
    ) -> Result<Vec<Job>, AppError> {
        let followers = self.db.get_followers(&sender.id).await?;

        let mut jobs = Vec::with_capacity(followers.len());
        for follower in followers.iter().filter(|follower| follower.is_remote) {
            jobs.push(self.federate_entity(entity, sender, &follower.uri).await?);
        }

        tracing::info!(
            kind = entity.kind().as_str(),
            uri = %entity.uri(),
            recipients = jobs.len(),
            "Fan-out queued"
        );
        Ok(jobs)
    }
}

/// Consumer side of the delivery queue
pub struct DeliveryWorker {
    db: Arc<Database>,
    resolver: Arc<EntityResolver>,
    client: Arc<FederationClient>,
}

impl DeliveryWorker {
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<EntityResolver>,
        client: Arc<FederationClient>,
    ) -> Self {
        Self {
            db,
            resolver,
            client,
        }
    }
}

#[async_trait]
impl JobHandler for DeliveryWorker {
    async fn run(&self, job: &Job) -> Result<(), JobError> {
        let payload: DeliveryPayload = serde_json::from_str(&job.payload)
            .map_err(|e| JobError::Permanent(format!("Unreadable delivery: {}", e)))?;

        let sender = self.db.get_actor(&payload.sender_id).await?.ok_or_else(|| {
            JobError::Rejected(format!("Sender {} no longer exists", payload.sender_id))
        })?;
        let identity = SigningIdentity::from_actor(&sender)
            .map_err(|e| JobError::Rejected(format!("Sender cannot sign: {}", e)))?;

        let recipient = self
            .resolver
            .resolve(&payload.recipient_uri)
            .await?
            .ok_or_else(|| {
                JobError::Rejected(format!("Unknown recipient {}", payload.recipient_uri))
            })?;

        let body = payload.entity.to_bytes()?;
        let status = self
            .client
            .post_signed(&recipient.inbox_url, body, &identity)
            .await
            .map_err(|error| match error {
                AppError::Forbidden | AppError::Validation(_) => {
                    JobError::Rejected(format!("Refused target {}: {}", recipient.inbox_url, error))
                }
                other => JobError::from(other),
            })?;

        if status.is_success() {
            crate::metrics::ENTITIES_SENT
                .with_label_values(&[payload.entity.kind().as_str()])
                .inc();
            tracing::debug!(
                inbox = %recipient.inbox_url,
                kind = payload.entity.kind().as_str(),
                "Delivered"
            );
            return Ok(());
        }

        let reason = format!("HTTP {} from {}", status.as_u16(), recipient.inbox_url);
        if is_retryable_status(status) {
            Err(JobError::Transient(reason))
        } else {
            Err(JobError::Rejected(reason))
        }
    }
}
