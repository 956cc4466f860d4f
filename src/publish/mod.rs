mod aggregation;
mod chunk_worker;
mod chunking;
mod orchestrator;
mod progress;
mod types;


use std::sync::Arc;

use crate::cache::TieredCache;
use crate::core::config::PublishSettings;
use crate::queue::QueueRegistry;
use crate::services::contracts::{
    ExamReader, NotificationDispatcher, ResultWriter, SubmissionMarker,
};

pub use aggregation::{AggregationProcessor, NotificationProcessor};
pub use chunk_worker::ChunkProcessor;
pub use orchestrator::{BulkPublisher, EngineHealth};
pub use progress::ProgressTracker;
pub use types::{
    aggregation_job_id, chunk_job_id, exam_context_key, progress_key, AggregationJobPayload,
    Chunk, ChunkJobRef, ChunkRunReport, ProgressRecord, PublishError, PublishOptions,
    RunDescriptor, AGGREGATION_QUEUE, CHUNK_QUEUE, NOTIFICATION_QUEUE,
};

/// Starts this process's share of the publish pipeline: chunk, aggregation
/// and notification worker pools on the shared registry. Idempotent per
/// queue within one process.
pub fn register_workers(
    registry: &QueueRegistry,
    cache: &TieredCache,
    reader: Arc<dyn ExamReader>,
    writer: Arc<dyn ResultWriter>,
    marker: Arc<dyn SubmissionMarker>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    settings: &PublishSettings,
    server_id: &str,
) {
    let tracker = ProgressTracker::new(cache.clone(), settings.progress_ttl_seconds);

    registry.worker(
        CHUNK_QUEUE,
        Arc::new(ChunkProcessor::new(
            Arc::clone(&reader),
            writer,
            marker,
            cache.clone(),
            tracker,
        )),
        settings.chunk_workers,
    );
    registry.worker(
        AGGREGATION_QUEUE,
        Arc::new(AggregationProcessor::new(
            reader,
            registry.clone(),
            settings.aggregation_wait_seconds,
            server_id.to_owned(),
        )),
        settings.aggregation_workers,
    );
    registry.worker(
        NOTIFICATION_QUEUE,
        Arc::new(NotificationProcessor::new(dispatcher)),
        settings.notification_workers,
    );
}
