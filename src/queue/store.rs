use async_trait::async_trait;
use tokio::time::Duration;

use super::job::{EnqueueStatus, Job, JobOutcome, QueueCounts};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job broker is not connected")]
    Unavailable,
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("malformed job record {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// The job went back to the delayed set for another attempt.
    Retried { delay_ms: u64 },
    /// Attempts are exhausted; the job is terminally failed.
    Exhausted,
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub promoted: u64,
    pub stalled: Vec<String>,
}

/// Broker seam. `RedisJobStore` is the shared production backing;
/// `MemoryJobStore` serves single-process development and tests.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotent on job id: enqueueing an id that already exists is a no-op.
    async fn enqueue(&self, job: &Job) -> Result<EnqueueStatus, QueueError>;

    /// Atomically takes the best eligible job (smallest priority, then oldest)
    /// and marks it active under a lease held by `server_id`. The returned
    /// job's `attempts_made` already counts this attempt.
    async fn claim(&self, queue: &str, server_id: &str) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, job: &Job, result: serde_json::Value) -> Result<(), QueueError>;

    /// Records the failure and either schedules a retry (exponential backoff)
    /// or finalizes the job once attempts are exhausted.
    async fn fail(&self, job: &Job, error: &str) -> Result<FailDisposition, QueueError>;

    async fn job(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    /// Blocks until the job reaches a terminal state or `ceiling` elapses.
    /// `None` means the ceiling ran out. Backed by a completion signal, not
    /// interval polling.
    async fn wait_for_finished(
        &self,
        job_id: &str,
        ceiling: Duration,
    ) -> Result<Option<JobOutcome>, QueueError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError>;

    /// Promotes due delayed jobs and requeues expired active leases.
    async fn run_maintenance(&self, queue: &str) -> Result<MaintenanceReport, QueueError>;

    async fn ping(&self) -> bool;

    async fn close(&self);
}
