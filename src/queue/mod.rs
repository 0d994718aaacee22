//! Durable job queues
//!
//! Three queues share one `jobs` table: `inbox`, `delivery` and `fetch`.
//! Each runs a pool of tokio workers that claim jobs atomically, execute
//! them through a [`JobHandler`] and settle the outcome:
//!
//! | handler result            | job status                          |
//! |---------------------------|-------------------------------------|
//! | `Ok`                      | `completed`                         |
//! | `JobError::Rejected`      | `failed` (no retry)                 |
//! | `JobError::Permanent`     | `dead_lettered` (no retry)          |
//! | `JobError::Transient`     | `pending` with backoff, or          |
//! |                           | `dead_lettered` once attempts run out |
//!
//! A claimed job is leased for the queue's visibility timeout; a worker
//! that dies mid-job leaves the lease to expire and the job is claimed
//! again. Delivery is therefore at-least-once and handlers are idempotent.

pub mod delivery;
pub mod fetch;
pub mod inbox;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::data::{Database, Job, JobStatus};
use crate::error::AppError;

pub use delivery::{DeliveryPayload, DeliveryQueue, DeliveryWorker};
pub use fetch::{FetchPayload, FetchQueue, FetchWorker};
pub use inbox::{InboxPayload, InboxQueue, InboxState, InboxWorker, RequestMeta};

/// Queue names as stored in `jobs.queue`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Inbox,
    Delivery,
    Fetch,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Delivery => "delivery",
            Self::Fetch => "fetch",
        }
    }
}

/// Failure of one job execution
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Storage or network failure; retry later
    #[error("transient: {0}")]
    Transient(String),
    /// Malformed or unprocessable job; dead-letter without retry
    #[error("permanent: {0}")]
    Permanent(String),
    /// Refused by verification or by the remote side; fail without retry
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<AppError> for JobError {
    fn from(error: AppError) -> Self {
        if error.is_transient() {
            JobError::Transient(error.to_string())
        } else if error.is_authentication() {
            JobError::Rejected(error.to_string())
        } else {
            JobError::Permanent(error.to_string())
        }
    }
}

/// Executes jobs of one queue
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: &Job) -> Result<(), JobError>;
}

/// Current time in unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Exponential backoff with jitter for the retry after `attempt`
///
/// `base * 2^(attempt-1)`, capped at `max`, plus up to 10% jitter
/// (at most one second).
pub fn next_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let pow = attempt.saturating_sub(1).min(20);
    let delay_ms = base_ms.saturating_mul(1u64 << pow).min(max_ms);
    let jitter_cap = (delay_ms / 10).min(1_000);
    let jitter_ms = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };
    Duration::from_millis(delay_ms + jitter_ms)
}

/// Handle to one durable queue
#[derive(Clone)]
pub struct JobQueue {
    kind: QueueKind,
    db: Arc<Database>,
    notify: Arc<Notify>,
    settings: QueueConfig,
}

impl JobQueue {
    pub fn new(kind: QueueKind, db: Arc<Database>, settings: QueueConfig) -> Self {
        Self {
            kind,
            db,
            notify: Arc::new(Notify::new()),
            settings,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn settings(&self) -> &QueueConfig {
        &self.settings
    }

    /// Persist a pending job and wake one worker
    pub async fn push<T: Serialize>(&self, payload: &T) -> Result<Job, AppError> {
        let payload = serde_json::to_string(payload).map_err(|e| AppError::Internal(e.into()))?;
        let job = self
            .db
            .push_job(
                self.kind.as_str(),
                &payload,
                self.settings.max_attempts,
                now_ms(),
            )
            .await?;

        self.notify.notify_one();
        tracing::debug!(queue = self.kind.as_str(), job_id = %job.id, "Job enqueued");
        Ok(job)
    }

    async fn claim(&self) -> Result<Option<Job>, AppError> {
        let lease_ms = self.settings.visibility_timeout().as_millis() as i64;
        self.db
            .claim_job(self.kind.as_str(), now_ms(), lease_ms)
            .await
    }

    /// Record the outcome of one attempt
    ///
    /// Returns `Running` without touching the job when the attempt lost its
    /// lease to a newer claim.
    async fn settle(
        &self,
        job: &Job,
        outcome: Result<(), JobError>,
        elapsed: Duration,
    ) -> Result<JobStatus, AppError> {
        let queue = self.kind.as_str();

        let (applied, status) = match outcome {
            Ok(()) => {
                let applied = self
                    .db
                    .finish_job(&job.id, job.attempts, JobStatus::Completed, None)
                    .await?;
                if applied {
                    tracing::debug!(queue, job_id = %job.id, attempts = job.attempts, "Job completed");
                }
                (applied, JobStatus::Completed)
            }
            Err(JobError::Rejected(reason)) => {
                let applied = self
                    .db
                    .finish_job(&job.id, job.attempts, JobStatus::Failed, Some(&reason))
                    .await?;
                if applied {
                    tracing::warn!(queue, job_id = %job.id, %reason, "Job rejected");
                }
                (applied, JobStatus::Failed)
            }
            Err(JobError::Permanent(reason)) => {
                let applied = self
                    .db
                    .finish_job(&job.id, job.attempts, JobStatus::DeadLettered, Some(&reason))
                    .await?;
                if applied {
                    tracing::warn!(queue, job_id = %job.id, %reason, "Job dead-lettered");
                }
                (applied, JobStatus::DeadLettered)
            }
            Err(JobError::Transient(reason)) if job.attempts_exhausted() => {
                let applied = self
                    .db
                    .finish_job(&job.id, job.attempts, JobStatus::DeadLettered, Some(&reason))
                    .await?;
                if applied {
                    tracing::warn!(
                        queue,
                        job_id = %job.id,
                        attempts = job.attempts,
                        %reason,
                        "Job dead-lettered after exhausting retries"
                    );
                }
                (applied, JobStatus::DeadLettered)
            }
            Err(JobError::Transient(reason)) => {
                let delay = next_backoff(
                    job.attempts.max(1) as u32,
                    self.settings.base_backoff_ms,
                    self.settings.max_backoff_ms,
                );
                let applied = self
                    .db
                    .retry_job(
                        &job.id,
                        job.attempts,
                        &reason,
                        now_ms() + delay.as_millis() as i64,
                    )
                    .await?;
                if applied {
                    tracing::info!(
                        queue,
                        job_id = %job.id,
                        attempts = job.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        %reason,
                        "Job scheduled for retry"
                    );
                }
                (applied, JobStatus::Pending)
            }
        };

        if !applied {
            tracing::warn!(
                queue,
                job_id = %job.id,
                attempts = job.attempts,
                "Lease lost before settling; outcome discarded"
            );
            crate::metrics::observe_job(queue, "stale", elapsed);
            return Ok(JobStatus::Running);
        }

        let outcome_label = match status {
            JobStatus::Pending => "retried",
            other => other.as_str(),
        };
        crate::metrics::observe_job(queue, outcome_label, elapsed);

        Ok(status)
    }
}

/// Claim and run at most one job
///
/// # Returns
/// The status the job was settled into, or None if nothing was runnable
pub async fn process_next(
    queue: &JobQueue,
    handler: &dyn JobHandler,
) -> Result<Option<JobStatus>, AppError> {
    let Some(job) = queue.claim().await? else {
        return Ok(None);
    };

    // Lease expired on the final attempt: the crashed run counted.
    if job.attempts > job.max_attempts {
        let outcome = Err(JobError::Permanent(
            "Lease expired after the final attempt".to_string(),
        ));
        return queue.settle(&job, outcome, Duration::ZERO).await.map(Some);
    }

    let active = crate::metrics::QUEUE_WORKERS_ACTIVE.with_label_values(&[queue.kind.as_str()]);
    active.inc();
    let started = Instant::now();
    let outcome = handler.run(&job).await;
    active.dec();

    queue.settle(&job, outcome, started.elapsed()).await.map(Some)
}

/// Spawn the worker pool of one queue
///
/// Workers stop once `shutdown` flips to `true`; a job already running
/// is finished first.
pub fn spawn_workers(
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let concurrency = queue.settings.concurrency.max(1);
    tracing::info!(
        queue = queue.kind.as_str(),
        concurrency,
        "Starting queue workers"
    );

    (0..concurrency)
        .map(|worker| {
            let queue = queue.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_worker(queue, handler, shutdown, worker).await })
        })
        .collect()
}

async fn run_worker(
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    mut shutdown: watch::Receiver<bool>,
    worker: usize,
) {
    let poll = queue.settings.poll_interval();

    loop {
        if *shutdown.borrow() {
            break;
        }

        match process_next(&queue, handler.as_ref()).await {
            Ok(Some(_)) => continue,
            Ok(None) => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(error) => {
                tracing::error!(queue = queue.kind.as_str(), worker, %error, "Queue worker error");
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    tracing::debug!(queue = queue.kind.as_str(), worker, "Queue worker stopped");
}
