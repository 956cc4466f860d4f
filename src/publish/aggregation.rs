use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::{Duration, Instant};

use crate::core::time::now_epoch_ms;
use crate::queue::{Job, JobOutcome, JobProcessor, QueueRegistry};
use crate::services::contracts::{
    AggregationOutcome, ExamReader, NotificationDispatcher, PublishNotification,
};

use super::types::{
    AggregationJobPayload, ChunkJobRef, ChunkRunReport, NOTIFICATION_JOB_NAME, NOTIFICATION_QUEUE,
};

/// Fan-in step of a publish run: waits on every chunk job, sums what the
/// chunks reported, persists the final outcome onto the exam record and
/// enqueues a fire-and-forget completion notification. A chunk that never
/// resolves within the wait ceiling is charged as errors for its whole span
/// instead of blocking the run.
pub struct AggregationProcessor {
    reader: Arc<dyn ExamReader>,
    registry: QueueRegistry,
    wait_ceiling: Duration,
    server_id: String,
}

impl AggregationProcessor {
    pub fn new(
        reader: Arc<dyn ExamReader>,
        registry: QueueRegistry,
        wait_ceiling_seconds: u64,
        server_id: String,
    ) -> Self {
        Self {
            reader,
            registry,
            wait_ceiling: Duration::from_secs(wait_ceiling_seconds.max(1)),
            server_id,
        }
    }

    async fn aggregate(&self, run: &AggregationJobPayload) -> Result<AggregationOutcome> {
        let started = Instant::now();
        let mut total_success = 0;
        let mut total_errors = 0;

        for chunk_ref in &run.chunk_refs {
            let (success, errors) = self.resolve_chunk(&run.exam_id, chunk_ref).await;
            total_success += success;
            total_errors += errors;
        }

        metrics::histogram!("publish_aggregation_wait_seconds")
            .record(started.elapsed().as_secs_f64());

        let outcome = AggregationOutcome {
            exam_id: run.exam_id.clone(),
            total_success,
            total_errors,
            total_chunks: run.total_chunks,
            server_id: self.server_id.clone(),
            completed_at: now_epoch_ms(),
        };

        self.reader
            .record_outcome(&outcome)
            .await
            .context("Failed to persist aggregation outcome")?;

        let coverage = if total_errors == 0 { "full" } else { "partial" };
        metrics::counter!("publish_runs_completed_total", "coverage" => coverage).increment(1);
        tracing::info!(
            exam_id = %run.exam_id,
            total_success,
            total_errors,
            total_chunks = run.total_chunks,
            coverage,
            "Aggregated bulk publish run"
        );

        self.enqueue_notification(&outcome).await;
        Ok(outcome)
    }

    /// Maps one chunk job to its (success, errors) contribution. Failed,
    /// timed-out and unreadable chunks all charge the full span as errors so
    /// no submission is ever silently dropped from the totals.
    async fn resolve_chunk(&self, exam_id: &str, chunk_ref: &ChunkJobRef) -> (u64, u64) {
        match self.registry.wait_for_finished(&chunk_ref.job_id, self.wait_ceiling).await {
            Ok(Some(JobOutcome::Completed { result })) => {
                match serde_json::from_value::<ChunkRunReport>(result) {
                    Ok(report) => (report.success, report.errors),
                    Err(err) => {
                        tracing::warn!(
                            exam_id,
                            job_id = %chunk_ref.job_id,
                            error = %err,
                            "Chunk result unreadable, counting its span as errors"
                        );
                        (0, chunk_ref.submissions)
                    }
                }
            }
            Ok(Some(JobOutcome::Failed { error })) => {
                tracing::warn!(
                    exam_id,
                    job_id = %chunk_ref.job_id,
                    error = %error,
                    "Chunk job failed, counting its span as errors"
                );
                (0, chunk_ref.submissions)
            }
            Ok(None) => {
                metrics::counter!("publish_chunk_waits_timed_out_total").increment(1);
                tracing::warn!(
                    exam_id,
                    job_id = %chunk_ref.job_id,
                    ceiling_seconds = self.wait_ceiling.as_secs(),
                    "Chunk job did not finish before the ceiling, counting its span as errors"
                );
                (0, chunk_ref.submissions)
            }
            Err(err) => {
                tracing::warn!(
                    exam_id,
                    job_id = %chunk_ref.job_id,
                    error = %err,
                    "Broker error while waiting on chunk, counting its span as errors"
                );
                (0, chunk_ref.submissions)
            }
        }
    }

    async fn enqueue_notification(&self, outcome: &AggregationOutcome) {
        let notification = PublishNotification {
            kind: "bulk-publish-completed".to_owned(),
            exam_id: outcome.exam_id.clone(),
            stats: outcome.clone(),
        };
        let payload = match serde_json::to_value(&notification) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(exam_id = %outcome.exam_id, error = %err, "Notification payload failed to serialize");
                return;
            }
        };

        if let Err(err) = self
            .registry
            .add_job(NOTIFICATION_QUEUE, NOTIFICATION_JOB_NAME, payload, Default::default())
            .await
        {
            tracing::warn!(exam_id = %outcome.exam_id, error = %err, "Failed to enqueue completion notification");
        }
    }
}

#[async_trait]
impl JobProcessor for AggregationProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value> {
        let run: AggregationJobPayload = serde_json::from_value(job.payload.clone())
            .context("Aggregation payload is malformed")?;
        let outcome = self.aggregate(&run).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}

/// Delivers queued completion notices through the injected dispatcher.
pub struct NotificationProcessor {
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl NotificationProcessor {
    pub fn new(dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobProcessor for NotificationProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value> {
        let notification: PublishNotification = serde_json::from_value(job.payload.clone())
            .context("Notification payload is malformed")?;
        self.dispatcher.dispatch(&notification).await?;
        Ok(serde_json::Value::Null)
    }
}
