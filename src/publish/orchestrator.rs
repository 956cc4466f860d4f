use std::sync::Arc;

use serde::Serialize;

use crate::cache::{CacheHealth, TieredCache};
use crate::core::config::PublishSettings;
use crate::queue::{BulkOptions, JobOptions, QueueRegistry, RegistryHealth};
use crate::services::contracts::ExamReader;

use super::chunking;
use super::progress::ProgressTracker;
use super::types::{
    aggregation_job_id, exam_context_key, AggregationJobPayload, ProgressRecord, PublishError,
    PublishOptions, RunDescriptor, AGGREGATION_JOB_NAME, AGGREGATION_QUEUE, CHUNK_QUEUE,
};

/// How many chunk jobs go to the broker per enqueue slice.
const ENQUEUE_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub healthy: bool,
    pub queues: RegistryHealth,
    pub cache: CacheHealth,
}

/// Entry point of the bulk-processing engine: fans an exam's computed scores
/// out into retryable chunk jobs over the shared broker, plus one aggregation
/// job that fans the results back in. Collaborators arrive through the
/// constructor so tests can swap in fakes.
pub struct BulkPublisher {
    reader: Arc<dyn ExamReader>,
    cache: TieredCache,
    registry: QueueRegistry,
    tracker: ProgressTracker,
    settings: PublishSettings,
    server_id: String,
}

impl BulkPublisher {
    pub fn new(
        reader: Arc<dyn ExamReader>,
        cache: TieredCache,
        registry: QueueRegistry,
        settings: PublishSettings,
        server_id: String,
    ) -> Self {
        let tracker = ProgressTracker::new(cache.clone(), settings.progress_ttl_seconds);
        Self { reader, cache, registry, tracker, settings, server_id }
    }

    /// Dispatches one exam's publish run. Validates the exam, partitions the
    /// eligible submissions, enqueues the chunk jobs (staggered, prioritized
    /// in dispatch groups) and then exactly one aggregation job. The
    /// aggregation job is enqueued only after the broker acknowledged every
    /// chunk, so it can never start waiting on a half-dispatched run.
    pub async fn distributed_bulk_publish(
        &self,
        exam_id: &str,
        options: PublishOptions,
    ) -> Result<RunDescriptor, PublishError> {
        let context = self
            .reader
            .exam_context(exam_id)
            .await?
            .ok_or_else(|| PublishError::ExamNotFound(exam_id.to_owned()))?;

        let submissions = self.reader.eligible_submissions(exam_id).await?;
        if submissions.is_empty() {
            tracing::info!(exam_id, "No eligible submissions, nothing to publish");
            return Ok(self.empty_descriptor(exam_id));
        }

        let chunk_size = options.chunk_size.unwrap_or(self.settings.chunk_size).max(1);
        let max_concurrency =
            options.max_concurrency.unwrap_or(self.settings.max_concurrency).max(1);
        let stagger_delay_ms = options.stagger_delay_ms.unwrap_or(self.settings.stagger_delay_ms);

        let warmed = self
            .cache
            .warm_cache(std::slice::from_ref(&context), |ctx| exam_context_key(&ctx.exam_id), None)
            .await;
        tracing::debug!(exam_id, warmed, "Warmed shared exam context");

        let total_submissions = submissions.len() as u64;
        let chunks = chunking::partition(exam_id, &self.server_id, submissions, chunk_size);
        let total_chunks = chunks.len() as u32;

        let jobs = chunking::plan_chunk_jobs(&chunks, max_concurrency)?;
        let chunk_refs = chunking::chunk_refs(&chunks);

        let report = self
            .registry
            .add_bulk_jobs(
                CHUNK_QUEUE,
                jobs,
                BulkOptions { batch_size: ENQUEUE_BATCH_SIZE, stagger_delay_ms },
            )
            .await?;

        // Every chunk enqueue is acknowledged at this point; the aggregation
        // job needs no start delay.
        let payload = AggregationJobPayload {
            exam_id: exam_id.to_owned(),
            total_chunks,
            eligible_count: total_submissions,
            chunk_refs,
        };
        let aggregation = self
            .registry
            .add_job(
                AGGREGATION_QUEUE,
                AGGREGATION_JOB_NAME,
                serde_json::to_value(&payload).map_err(anyhow::Error::from)?,
                JobOptions {
                    job_id: Some(aggregation_job_id(exam_id)),
                    ..JobOptions::default()
                },
            )
            .await?;

        let estimated_time_minutes = chunking::estimate_minutes(
            total_chunks,
            max_concurrency,
            self.settings.estimate_seconds_per_chunk,
        );

        metrics::counter!("publish_runs_started_total").increment(1);
        metrics::counter!("publish_jobs_enqueued_total").increment(report.enqueued as u64);
        tracing::info!(
            exam_id,
            total_submissions,
            total_chunks,
            chunk_size,
            queued_jobs = report.enqueued,
            duplicates = report.duplicates,
            stagger_delay_ms,
            aggregation_job_id = %aggregation.id,
            "Dispatched bulk publish run"
        );

        Ok(RunDescriptor {
            exam_id: exam_id.to_owned(),
            total_submissions,
            total_chunks,
            queued_jobs: report.enqueued,
            aggregation_job_id: Some(aggregation.id),
            estimated_time_minutes,
            progress_url: self.progress_url(exam_id),
        })
    }

    /// Pure read of the cached progress record; `None` before the first chunk
    /// resolves or after the record's TTL expired.
    pub async fn get_progress(&self, exam_id: &str) -> Option<ProgressRecord> {
        self.tracker.read(exam_id).await
    }

    pub async fn health_check(&self) -> EngineHealth {
        let queues = self.registry.health_check().await;
        let cache = self.cache.health_check().await;
        EngineHealth { healthy: queues.healthy && cache.healthy, queues, cache }
    }

    fn empty_descriptor(&self, exam_id: &str) -> RunDescriptor {
        RunDescriptor {
            exam_id: exam_id.to_owned(),
            total_submissions: 0,
            total_chunks: 0,
            queued_jobs: 0,
            aggregation_job_id: None,
            estimated_time_minutes: 0,
            progress_url: self.progress_url(exam_id),
        }
    }

    fn progress_url(&self, exam_id: &str) -> String {
        format!(
            "{}/exams/{exam_id}/publish-progress",
            self.settings.progress_url_base.trim_end_matches('/')
        )
    }
}
