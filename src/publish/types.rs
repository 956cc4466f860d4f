use serde::{Deserialize, Serialize};

use crate::queue::QueueError;
use crate::services::contracts::SubmissionRef;

pub const CHUNK_QUEUE: &str = "bulk-publish";
pub const AGGREGATION_QUEUE: &str = "result-aggregation";
pub const NOTIFICATION_QUEUE: &str = "publish-notifications";

pub(crate) const CHUNK_JOB_NAME: &str = "publish-chunk";
pub(crate) const AGGREGATION_JOB_NAME: &str = "aggregate-run";
pub(crate) const NOTIFICATION_JOB_NAME: &str = "publish-completed";

/// Deterministic chunk-job id. Re-dispatching the same exam produces the same
/// ids, which the broker treats as no-ops while the originals still exist.
pub fn chunk_job_id(exam_id: &str, chunk_index: u32) -> String {
    format!("bulk-publish-{exam_id}-chunk-{chunk_index}")
}

pub fn aggregation_job_id(exam_id: &str) -> String {
    format!("bulk-publish-{exam_id}-aggregation")
}

pub fn progress_key(exam_id: &str) -> String {
    format!("progress:{exam_id}")
}

pub fn exam_context_key(exam_id: &str) -> String {
    format!("exam:{exam_id}:context")
}

/// One retryable unit of a publish run: a bounded slice of the exam's eligible
/// submissions, carried whole inside the chunk job's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub exam_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub submission_refs: Vec<SubmissionRef>,
    pub server_id: String,
}

/// Stored as the chunk job's result; the aggregation step sums these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRunReport {
    pub chunk_index: u32,
    pub success: u64,
    pub errors: u64,
}

/// What the aggregation job needs to fan in one chunk: its broker id and the
/// submission span to charge as errors if the chunk never resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkJobRef {
    pub job_id: String,
    pub chunk_index: u32,
    pub submissions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationJobPayload {
    pub exam_id: String,
    pub total_chunks: u32,
    pub eligible_count: u64,
    pub chunk_refs: Vec<ChunkJobRef>,
}

/// Shared fan-out/fan-in counters for one exam's run, kept in the cache under
/// `progress:<exam_id>`. Created lazily by the first chunk that finishes;
/// garbage-collected by TTL if the run stalls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub exam_id: String,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub total_success: u64,
    pub total_errors: u64,
    pub start_time: i64,
    pub last_update: i64,
}

/// What `distributed_bulk_publish` hands back to the caller. A run with zero
/// eligible submissions returns the no-op shape: zero chunks, nothing queued,
/// no aggregation job.
#[derive(Debug, Clone, Serialize)]
pub struct RunDescriptor {
    pub exam_id: String,
    pub total_submissions: u64,
    pub total_chunks: u32,
    pub queued_jobs: usize,
    pub aggregation_job_id: Option<String>,
    pub estimated_time_minutes: u64,
    pub progress_url: String,
}

/// Per-call overrides; anything left `None` falls back to `PublishSettings`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    pub chunk_size: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub stagger_delay_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Validation: surfaced to the caller before anything is dispatched.
    #[error("exam {0} not found")]
    ExamNotFound(String),
    /// The broker refused an enqueue. Fails this call, not the process.
    #[error("failed to enqueue publish jobs")]
    Enqueue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
