use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use crate::cache::TieredCache;
use crate::queue::{Job, JobProcessor};
use crate::services::contracts::{ExamContext, ExamReader, ResultUpdate, ResultWriter, SubmissionMarker};

use super::progress::ProgressTracker;
use super::types::{exam_context_key, Chunk, ChunkRunReport};

/// Processes one chunk job: a single bulk write of the chunk's scores, mark
/// the submissions published, fold the counts into the shared progress record.
/// Any failure propagates so the broker retries the whole chunk; there is no
/// finer-grained partial-commit tracking here.
pub struct ChunkProcessor {
    reader: Arc<dyn ExamReader>,
    writer: Arc<dyn ResultWriter>,
    marker: Arc<dyn SubmissionMarker>,
    cache: TieredCache,
    tracker: ProgressTracker,
}

impl ChunkProcessor {
    pub fn new(
        reader: Arc<dyn ExamReader>,
        writer: Arc<dyn ResultWriter>,
        marker: Arc<dyn SubmissionMarker>,
        cache: TieredCache,
        tracker: ProgressTracker,
    ) -> Self {
        Self { reader, writer, marker, cache, tracker }
    }

    async fn publish_chunk(&self, chunk: &Chunk) -> Result<ChunkRunReport> {
        let started = Instant::now();
        let context = self.exam_context(&chunk.exam_id).await?;

        let updates: Vec<ResultUpdate> = chunk
            .submission_refs
            .iter()
            .map(|submission| ResultUpdate {
                student_id: submission.student_id.clone(),
                subject_ref: context.subject_ref.clone(),
                classroom_ref: context.classroom_ref.clone(),
                session: context.session.clone(),
                term: context.term.clone(),
                score: submission.raw_score,
                max_score: context.total_marks,
            })
            .collect();

        let report = self.writer.bulk_write(&updates).await.context("Bulk result write failed")?;

        let submission_ids: Vec<String> = chunk
            .submission_refs
            .iter()
            .map(|submission| submission.submission_id.clone())
            .collect();
        self.marker
            .mark_published(&submission_ids)
            .await
            .context("Failed to mark submissions published")?;

        // The write response accounts for every row: whatever it neither
        // modified nor upserted counts against the run as errors.
        let span = chunk.submission_refs.len() as u64;
        let success = (report.modified + report.upserted).min(span);
        let errors = span - success;
        if !report.errors.is_empty() {
            tracing::warn!(
                exam_id = %chunk.exam_id,
                chunk_index = chunk.chunk_index,
                write_errors = report.errors.len(),
                first = %report.errors[0],
                "Result store reported row errors"
            );
        }

        metrics::counter!("publish_chunks_total", "status" => "success").increment(1);
        metrics::histogram!("publish_chunk_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::info!(
            exam_id = %chunk.exam_id,
            chunk_index = chunk.chunk_index,
            span,
            success,
            errors,
            "Published score chunk"
        );

        Ok(ChunkRunReport { chunk_index: chunk.chunk_index, success, errors })
    }

    /// The orchestrator warms this key at dispatch; the loader only runs when
    /// the entry expired or the worker sits on another process with a cold
    /// local tier and no shared tier.
    async fn exam_context(&self, exam_id: &str) -> Result<ExamContext> {
        let reader = Arc::clone(&self.reader);
        self.cache
            .get_with(&exam_context_key(exam_id), None, move || async move {
                reader.exam_context(exam_id).await
            })
            .await?
            .with_context(|| format!("Exam {exam_id} vanished mid-run"))
    }
}

#[async_trait]
impl JobProcessor for ChunkProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value> {
        let chunk: Chunk =
            serde_json::from_value(job.payload.clone()).context("Chunk payload is malformed")?;

        match self.publish_chunk(&chunk).await {
            Ok(report) => {
                self.tracker
                    .record_chunk(&chunk.exam_id, chunk.total_chunks, report.success, report.errors)
                    .await;
                Ok(serde_json::to_value(report)?)
            }
            Err(err) => {
                // On the last attempt the whole span lands in the error
                // column; intermediate attempts leave progress untouched so
                // completed_chunks stays monotonic.
                if job.attempts_exhausted() {
                    metrics::counter!("publish_chunks_total", "status" => "failed").increment(1);
                    self.tracker
                        .record_chunk(
                            &chunk.exam_id,
                            chunk.total_chunks,
                            0,
                            chunk.submission_refs.len() as u64,
                        )
                        .await;
                }
                Err(err)
            }
        }
    }
}
