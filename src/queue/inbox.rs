//! Inbox queue
//!
//! Accepted inbound requests are persisted with their raw body and
//! signature headers before the sender gets a response. A worker later
//! walks each one through
//!
//! ```text
//! received -> verifying -> verified -> dispatched -> processed
//!                 |                        |
//!                 v                        v
//!        verification_failed        retrying / dead_lettered
//! ```
//!
//! The state is derived from the job row (status, stage, attempts), so a
//! restart resumes every unfinished entry from `received`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use super::{JobError, JobHandler, JobQueue, QueueKind};
use crate::config::QueueConfig;
use crate::data::{Database, Job, JobStatus};
use crate::error::AppError;
use crate::federation::entity::{EntityEnvelope, uri_authority};
use crate::federation::signature::{KeyResolver, SignatureHeaders, check_freshness, verify_request};
use crate::federation::{HandlerContext, HandlerRegistry};

const STAGE_VERIFYING: &str = "verifying";
const STAGE_VERIFIED: &str = "verified";
const STAGE_DISPATCHED: &str = "dispatched";

/// Processing state of one inbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxState {
    Received,
    Verifying,
    Verified,
    Dispatched,
    Processed,
    VerificationFailed,
    /// Dispatch failed transiently; pending another attempt
    Retrying,
    DeadLettered,
}

impl InboxState {
    /// Derive the state of an inbox job
    pub fn from_job(job: &Job) -> Option<Self> {
        let state = match job.status()? {
            JobStatus::Pending if job.attempts == 0 => Self::Received,
            JobStatus::Pending => Self::Retrying,
            JobStatus::Running => match job.stage.as_deref() {
                Some(STAGE_VERIFIED) => Self::Verified,
                Some(STAGE_DISPATCHED) => Self::Dispatched,
                _ => Self::Verifying,
            },
            JobStatus::Completed => Self::Processed,
            JobStatus::Failed => Self::VerificationFailed,
            JobStatus::DeadLettered => Self::DeadLettered,
        };
        Some(state)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Processed | Self::VerificationFailed | Self::DeadLettered
        )
    }
}

/// Request details needed to verify the signature later
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Lowercase HTTP method
    pub method: String,
    /// Path and query as received
    pub path: String,
    /// Peer address of the connection
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Local username for per-actor inboxes, None for the shared inbox
    #[serde(default)]
    pub recipient: Option<String>,
}

/// Persisted inbox entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxPayload {
    /// Raw body, byte-exact as received
    pub body: String,
    pub signature: SignatureHeaders,
    pub meta: RequestMeta,
    pub received_at: DateTime<Utc>,
}

/// Producer side of the inbox queue
#[derive(Clone)]
pub struct InboxQueue {
    queue: JobQueue,
    db: Arc<Database>,
}

impl InboxQueue {
    pub fn new(db: Arc<Database>, settings: QueueConfig) -> Self {
        Self {
            queue: JobQueue::new(QueueKind::Inbox, db.clone(), settings),
            db,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Synchronous checks run before a request is accepted
    ///
    /// Signature headers must be present and fresh, and the body must be a
    /// JSON object with a string `type`. Signature cryptography and signer
    /// resolution are deferred to the worker.
    ///
    /// # Errors
    /// - `InvalidSignature` for missing or stale signature headers
    /// - `Validation` for bodies that are not typed JSON objects
    pub fn validate(
        headers: &HeaderMap,
        body: &[u8],
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<SignatureHeaders, AppError> {
        let signature = SignatureHeaders::from_header_map(headers)?;
        check_freshness(signature.signed_at, now, max_age)?;

        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Body is not JSON: {}", e)))?;
        if value.get("type").and_then(|tag| tag.as_str()).is_none() {
            return Err(AppError::Validation(
                "Body must be an object with a string type".to_string(),
            ));
        }

        Ok(signature)
    }

    /// Persist an accepted request
    ///
    /// `body` must already have passed [`InboxQueue::validate`].
    pub async fn enqueue(
        &self,
        body: &[u8],
        signature: SignatureHeaders,
        meta: RequestMeta,
    ) -> Result<Job, AppError> {
        let body = String::from_utf8(body.to_vec())
            .map_err(|_| AppError::Validation("Body is not UTF-8".to_string()))?;
        let payload = InboxPayload {
            body,
            signature,
            meta,
            received_at: Utc::now(),
        };

        let job = self.queue.push(&payload).await?;
        tracing::debug!(
            job_id = %job.id,
            signer = %payload.signature.signed_by,
            "Inbox entry accepted"
        );
        Ok(job)
    }

    /// Current state of an inbox entry
    pub async fn state(&self, job_id: &str) -> Result<Option<InboxState>, AppError> {
        Ok(self
            .db
            .get_job(job_id)
            .await?
            .filter(|job| job.queue == QueueKind::Inbox.as_str())
            .and_then(|job| InboxState::from_job(&job)))
    }
}

/// Consumer side of the inbox queue
pub struct InboxWorker {
    db: Arc<Database>,
    keys: Arc<dyn KeyResolver>,
    handlers: Arc<HandlerRegistry>,
    ctx: HandlerContext,
    max_age: Duration,
}

impl InboxWorker {
    pub fn new(
        keys: Arc<dyn KeyResolver>,
        handlers: Arc<HandlerRegistry>,
        ctx: HandlerContext,
        max_age: Duration,
    ) -> Self {
        Self {
            db: ctx.db.clone(),
            keys,
            handlers,
            ctx,
            max_age,
        }
    }

    async fn stage(&self, job: &Job, stage: &str) -> Result<(), JobError> {
        let held = self
            .db
            .set_job_stage(&job.id, job.attempts, stage)
            .await
            .map_err(JobError::from)?;
        if !held {
            // A newer attempt owns the job; stop before doing its work twice
            return Err(JobError::Transient("Lease lost".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for InboxWorker {
    async fn run(&self, job: &Job) -> Result<(), JobError> {
        let payload: InboxPayload = serde_json::from_str(&job.payload)
            .map_err(|e| JobError::Permanent(format!("Unreadable inbox entry: {}", e)))?;

        self.stage(job, STAGE_VERIFYING).await?;
        let signer_uri = verify_request(
            self.keys.as_ref(),
            &payload.meta.method,
            &payload.meta.path,
            &payload.signature,
            payload.body.as_bytes(),
            self.max_age,
            payload.received_at,
        )
        .await?;

        let value: serde_json::Value = serde_json::from_str(&payload.body)
            .map_err(|e| JobError::Permanent(format!("Body is not JSON: {}", e)))?;
        let envelope = EntityEnvelope::inspect(&value)?;

        if envelope.author != signer_uri {
            return Err(JobError::Rejected(format!(
                "Entity author {} is not the signer {}",
                envelope.author, signer_uri
            )));
        }
        if uri_authority(&envelope.uri) != uri_authority(&signer_uri) {
            return Err(JobError::Rejected(format!(
                "Entity {} is not hosted by the signer's instance",
                envelope.uri
            )));
        }

        let signer = self
            .db
            .get_actor_by_uri(&signer_uri)
            .await?
            .ok_or_else(|| JobError::Transient(format!("Signer {} vanished", signer_uri)))?;
        self.stage(job, STAGE_VERIFIED).await?;

        let handler = self.handlers.get(envelope.kind).ok_or_else(|| {
            JobError::Permanent(format!("No handler for {}", envelope.kind.as_str()))
        })?;

        self.stage(job, STAGE_DISPATCHED).await?;
        handler.handle(&self.ctx, &signer, value).await?;

        crate::metrics::ENTITIES_RECEIVED
            .with_label_values(&[envelope.kind.as_str()])
            .inc();
        tracing::info!(
            kind = envelope.kind.as_str(),
            uri = %envelope.uri,
            signer = %signer_uri,
            "Inbound entity processed"
        );
        Ok(())
    }
}
