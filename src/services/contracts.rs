use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Reference data shared by every chunk of one exam's publish run. Warmed into
/// the cache once at dispatch so workers avoid refetching it per chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamContext {
    pub exam_id: String,
    pub subject_ref: String,
    pub classroom_ref: String,
    pub session: String,
    pub term: String,
    pub total_marks: f64,
}

/// The slice of a submission the publish pipeline carries through job payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRef {
    pub submission_id: String,
    pub student_id: String,
    pub raw_score: f64,
}

/// One report-card row to write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultUpdate {
    pub student_id: String,
    pub subject_ref: String,
    pub classroom_ref: String,
    pub session: String,
    pub term: String,
    pub score: f64,
    pub max_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkWriteReport {
    pub modified: u64,
    pub upserted: u64,
    pub errors: Vec<String>,
}

/// Durable terminus of one publish run, persisted onto the exam record.
/// Timestamps are unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationOutcome {
    pub exam_id: String,
    pub total_success: u64,
    pub total_errors: u64,
    pub total_chunks: u32,
    pub server_id: String,
    pub completed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishNotification {
    pub kind: String,
    pub exam_id: String,
    pub stats: AggregationOutcome,
}

/// Read side of the exam domain plus the single write the aggregation step
/// needs (stamping the run outcome onto the exam record).
#[async_trait]
pub trait ExamReader: Send + Sync {
    async fn exam_context(&self, exam_id: &str) -> anyhow::Result<Option<ExamContext>>;

    async fn eligible_submissions(&self, exam_id: &str) -> anyhow::Result<Vec<SubmissionRef>>;

    async fn record_outcome(&self, outcome: &AggregationOutcome) -> anyhow::Result<()>;
}

/// Sole mutation point for published scores. Implementations must stay
/// idempotent for a retried chunk: writing the same updates twice leaves the
/// same rows.
#[async_trait]
pub trait ResultWriter: Send + Sync {
    async fn bulk_write(&self, updates: &[ResultUpdate]) -> anyhow::Result<BulkWriteReport>;
}

#[async_trait]
pub trait SubmissionMarker: Send + Sync {
    async fn mark_published(&self, submission_ids: &[String]) -> anyhow::Result<()>;
}

/// Fire-and-forget delivery of run-completion notices.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: &PublishNotification) -> anyhow::Result<()>;
}
