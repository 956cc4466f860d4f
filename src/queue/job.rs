use serde::{Deserialize, Serialize};

use crate::core::config::QueueSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "delayed" => Some(Self::Delayed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of work owned by the broker. Smaller `priority` is claimed sooner;
/// jobs of equal priority run in enqueue order.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub delay_ms: u64,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub state: JobState,
    pub enqueued_at_ms: i64,
    pub claimed_by: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Job {
    /// Delay before the next attempt after `attempts_made` failed ones.
    /// Doubles per attempt starting from the backoff base.
    pub fn retry_delay_ms(&self) -> u64 {
        let exponent = self.attempts_made.saturating_sub(1).min(16);
        self.backoff_base_ms.saturating_mul(1_u64 << exponent)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

/// Per-job overrides for [`QueueRegistry::add_job`](crate::queue::QueueRegistry::add_job).
/// Anything left `None` falls back to the queue's defaults.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub job_id: Option<String>,
    pub priority: Option<i64>,
    pub delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub payload: serde_json::Value,
    pub opts: JobOptions,
}

/// Queue-level defaults applied to every job that does not override them.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub completed_retention: usize,
    pub failed_retention: usize,
}

impl QueueOptions {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            backoff_base_ms: settings.backoff_base_ms,
            completed_retention: settings.completed_retention,
            failed_retention: settings.failed_retention,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    Enqueued,
    /// A job with this id already exists at the broker; enqueue was a no-op.
    AlreadyExists,
}

#[derive(Debug, Clone)]
pub struct EnqueuedJob {
    pub id: String,
    pub status: EnqueueStatus,
}

/// Controls for a bulk enqueue: jobs are pushed in slices of `batch_size`,
/// and when `stagger_delay_ms` is set, job `i` gets a delay of
/// `i * stagger_delay_ms` unless it carries its own.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub batch_size: usize,
    pub stagger_delay_ms: u64,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self { batch_size: 50, stagger_delay_ms: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct BulkEnqueueReport {
    pub batch_id: String,
    pub job_ids: Vec<String>,
    pub enqueued: usize,
    pub duplicates: usize,
}

/// Terminal result of a job, read back by whoever waits on it.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed { result: serde_json::Value },
    Failed { error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Job lifecycle events emitted by workers and maintenance, consumed by the
/// registry's status tracker.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Active { queue: String, job_id: String, attempts_made: u32 },
    Completed { queue: String, job_id: String, attempts_made: u32 },
    Failed { queue: String, job_id: String, attempts_made: u32, error: String },
    Retried { queue: String, job_id: String, attempts_made: u32, delay_ms: u64, error: String },
    Stalled { queue: String, job_id: String },
}

/// What the status tracker persists under `job:<id>:status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub job_id: String,
    pub queue: String,
    pub state: JobState,
    pub attempts_made: u32,
    pub server_id: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
