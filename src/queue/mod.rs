mod job;
mod memory_store;
mod redis_store;
mod store;
mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::cache::TieredCache;
use crate::core::config::QueueSettings;
use crate::core::time::format_offset;

pub use job::{
    BulkEnqueueReport, BulkOptions, EnqueueStatus, EnqueuedJob, Job, JobEvent, JobOptions,
    JobOutcome, JobState, JobStatusRecord, NewJob, QueueCounts, QueueOptions,
};
pub use memory_store::MemoryJobStore;
pub use redis_store::RedisJobStore;
pub use store::{FailDisposition, JobStore, MaintenanceReport, QueueError};
pub use worker::JobProcessor;

use worker::WorkerConfig;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-process manager of named queues and their worker pools over a shared
/// broker. Jobs enqueued here can be claimed by any cooperating process.
/// Lifecycle events flow through one status-tracker task that write-throughs
/// `job:<id>:status` into the cache.
#[derive(Clone)]
pub struct QueueRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<dyn JobStore>,
    cache: TieredCache,
    server_id: String,
    defaults: QueueSettings,
    queues: Mutex<HashMap<String, QueueOptions>>,
    worker_queues: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tracker: Mutex<Option<JoinHandle<()>>>,
    events_tx: Mutex<Option<mpsc::Sender<JobEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    pub healthy: bool,
    pub broker_reachable: bool,
    pub queues: HashMap<String, QueueCounts>,
}

impl QueueRegistry {
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: TieredCache,
        server_id: String,
        defaults: QueueSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let tracker = tokio::spawn(run_status_tracker(
            events_rx,
            cache.clone(),
            server_id.clone(),
            defaults.job_status_ttl_seconds,
        ));

        Self {
            inner: Arc::new(RegistryInner {
                store,
                cache,
                server_id,
                defaults,
                queues: Mutex::new(HashMap::new()),
                worker_queues: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Vec::new()),
                tracker: Mutex::new(Some(tracker)),
                events_tx: Mutex::new(Some(events_tx)),
                shutdown_tx,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Idempotently registers a queue and starts its maintenance loop. Later
    /// calls return the options recorded by the first one.
    pub fn queue(&self, name: &str, opts: Option<QueueOptions>) -> QueueOptions {
        let opts = {
            let mut queues = lock(&self.inner.queues);
            if let Some(existing) = queues.get(name) {
                return existing.clone();
            }
            let opts = opts.unwrap_or_else(|| QueueOptions::from_settings(&self.inner.defaults));
            queues.insert(name.to_owned(), opts.clone());
            opts
        };

        if let Some(events_tx) = lock(&self.inner.events_tx).clone() {
            let handle = tokio::spawn(run_maintenance_loop(
                name.to_owned(),
                Arc::clone(&self.inner.store),
                events_tx,
                self.inner.defaults.maintenance_interval_seconds,
                self.inner.shutdown_tx.subscribe(),
            ));
            lock(&self.inner.tasks).push(handle);
        }

        tracing::info!(queue = name, "Registered queue");
        opts
    }

    /// Idempotently starts a worker pool for the queue. Returns false when a
    /// pool for this queue already runs in this process.
    pub fn worker(
        &self,
        queue: &str,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
    ) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            tracing::warn!(queue, "Registry is closed, refusing to start workers");
            return false;
        }

        self.queue(queue, None);
        if !lock(&self.inner.worker_queues).insert(queue.to_owned()) {
            tracing::debug!(queue, "Worker pool already registered");
            return false;
        }

        let Some(events_tx) = lock(&self.inner.events_tx).clone() else {
            return false;
        };

        let concurrency = concurrency.max(1);
        let mut tasks = lock(&self.inner.tasks);
        for _ in 0..concurrency {
            let config = WorkerConfig {
                queue: queue.to_owned(),
                server_id: self.inner.server_id.clone(),
                poll_interval_ms: self.inner.defaults.poll_interval_ms,
                poll_jitter_ms: self.inner.defaults.poll_jitter_ms,
            };
            tasks.push(tokio::spawn(worker::run_worker_loop(
                config,
                Arc::clone(&self.inner.store),
                Arc::clone(&processor),
                events_tx.clone(),
                self.inner.shutdown_tx.subscribe(),
            )));
        }

        tracing::info!(queue, concurrency, "Registered worker pool");
        true
    }

    pub async fn add_job(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<EnqueuedJob, QueueError> {
        let queue_opts = self.queue(queue, None);
        let job = self.build_job(queue, &queue_opts, name, payload, &opts);
        let status = self.inner.store.enqueue(&job).await?;
        match status {
            EnqueueStatus::Enqueued => {
                metrics::counter!("queue_jobs_enqueued_total", "queue" => queue.to_owned())
                    .increment(1);
                tracing::debug!(job_id = %job.id, queue, delay_ms = job.delay_ms, "Enqueued job");
            }
            EnqueueStatus::AlreadyExists => {
                tracing::debug!(job_id = %job.id, queue, "Job already queued, skipping");
            }
        }
        Ok(EnqueuedJob { id: job.id, status })
    }

    /// Bulk enqueue with per-index stagger delays. Records a
    /// `batch:<batch_id>` manifest of job ids in the cache.
    pub async fn add_bulk_jobs(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
        bulk: BulkOptions,
    ) -> Result<BulkEnqueueReport, QueueError> {
        let queue_opts = self.queue(queue, None);
        let batch_id = Uuid::new_v4().to_string();
        let batch_size = bulk.batch_size.max(1);

        let mut job_ids = Vec::with_capacity(jobs.len());
        let mut enqueued = 0;
        let mut duplicates = 0;

        for (batch_index, batch) in jobs.chunks(batch_size).enumerate() {
            for (offset, new_job) in batch.iter().enumerate() {
                let index = batch_index * batch_size + offset;
                let mut opts = new_job.opts.clone();
                if opts.delay_ms.is_none() && bulk.stagger_delay_ms > 0 {
                    opts.delay_ms = Some(index as u64 * bulk.stagger_delay_ms);
                }

                let job =
                    self.build_job(queue, &queue_opts, &new_job.name, new_job.payload.clone(), &opts);
                match self.inner.store.enqueue(&job).await? {
                    EnqueueStatus::Enqueued => enqueued += 1,
                    EnqueueStatus::AlreadyExists => duplicates += 1,
                }
                job_ids.push(job.id);
            }
            tokio::task::yield_now().await;
        }

        metrics::counter!("queue_jobs_enqueued_total", "queue" => queue.to_owned())
            .increment(enqueued as u64);

        let manifest_key = format!("batch:{batch_id}");
        self.inner.cache.set(&manifest_key, &job_ids, None).await;

        tracing::info!(
            queue,
            batch_id = %batch_id,
            jobs = job_ids.len(),
            enqueued,
            duplicates,
            "Bulk enqueued jobs"
        );
        Ok(BulkEnqueueReport { batch_id, job_ids, enqueued, duplicates })
    }

    /// Cache-first status lookup; on a miss reads the broker record and
    /// write-throughs what it found.
    pub async fn job_status(&self, job_id: &str) -> Option<JobStatusRecord> {
        let key = format!("job:{job_id}:status");
        if let Some(record) = self.inner.cache.get::<JobStatusRecord>(&key).await {
            return Some(record);
        }

        match self.inner.store.job(job_id).await {
            Ok(Some(job)) => {
                let record = JobStatusRecord {
                    job_id: job.id,
                    queue: job.queue_name,
                    state: job.state,
                    attempts_made: job.attempts_made,
                    server_id: job.claimed_by.unwrap_or_default(),
                    updated_at: format_offset(OffsetDateTime::now_utc()),
                    error: job.error,
                };
                self.inner
                    .cache
                    .set(&key, &record, Some(self.inner.defaults.job_status_ttl_seconds))
                    .await;
                Some(record)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(job_id, error = %err, "Failed to read job from broker");
                None
            }
        }
    }

    pub async fn wait_for_finished(
        &self,
        job_id: &str,
        ceiling: Duration,
    ) -> Result<Option<JobOutcome>, QueueError> {
        self.inner.store.wait_for_finished(job_id, ceiling).await
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.inner.store.job(job_id).await
    }

    pub async fn queue_stats(&self, name: &str) -> Result<QueueCounts, QueueError> {
        self.inner.store.counts(name).await
    }

    pub async fn all_queue_stats(&self) -> HashMap<String, QueueCounts> {
        let names: Vec<String> = lock(&self.inner.queues).keys().cloned().collect();
        let mut all = HashMap::with_capacity(names.len());
        for name in names {
            match self.inner.store.counts(&name).await {
                Ok(counts) => {
                    all.insert(name, counts);
                }
                Err(err) => {
                    tracing::warn!(queue = %name, error = %err, "Failed to read queue counts");
                }
            }
        }
        all
    }

    pub async fn health_check(&self) -> RegistryHealth {
        let broker_reachable = self.inner.store.ping().await;
        let queues = self.all_queue_stats().await;
        RegistryHealth { healthy: broker_reachable, broker_reachable, queues }
    }

    /// Drains in order: workers and maintenance loops stop, the status
    /// tracker consumes what is left, then the broker connection closes.
    /// Each stage is bounded by the configured drain timeout.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drain_timeout = Duration::from_secs(self.inner.defaults.drain_timeout_seconds.max(1));
        tracing::info!("Draining queue registry");

        if self.inner.shutdown_tx.send(true).is_err() {
            tracing::debug!("No queue tasks were listening for shutdown");
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.inner.tasks));
        let join_all = async {
            for handle in tasks {
                if let Err(err) = handle.await {
                    tracing::error!(error = %err, "Queue task join failed");
                }
            }
        };
        if tokio::time::timeout(drain_timeout, join_all).await.is_err() {
            tracing::warn!("Queue workers did not stop within the drain timeout");
        } else {
            tracing::info!("Queue workers stopped");
        }

        // Dropping the last sender lets the tracker drain and exit.
        drop(lock(&self.inner.events_tx).take());
        if let Some(tracker) = lock(&self.inner.tracker).take() {
            match tokio::time::timeout(drain_timeout, tracker).await {
                Ok(Ok(())) => tracing::info!("Status tracker drained"),
                Ok(Err(err)) => tracing::error!(error = %err, "Status tracker join failed"),
                Err(_) => tracing::warn!("Status tracker did not drain within the timeout"),
            }
        }

        self.inner.store.close().await;
        tracing::info!("Queue registry closed");
    }

    fn build_job(
        &self,
        queue: &str,
        queue_opts: &QueueOptions,
        name: &str,
        payload: serde_json::Value,
        opts: &JobOptions,
    ) -> Job {
        let delay_ms = opts.delay_ms.unwrap_or(0);
        Job {
            id: opts.job_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            queue_name: queue.to_owned(),
            name: name.to_owned(),
            payload,
            priority: opts.priority.unwrap_or(0),
            delay_ms,
            attempts_made: 0,
            max_attempts: opts.max_attempts.unwrap_or(queue_opts.max_attempts),
            backoff_base_ms: queue_opts.backoff_base_ms,
            state: if delay_ms > 0 { JobState::Delayed } else { JobState::Waiting },
            enqueued_at_ms: crate::core::time::now_epoch_ms(),
            claimed_by: None,
            error: None,
            result: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_status_tracker(
    mut events: mpsc::Receiver<JobEvent>,
    cache: TieredCache,
    server_id: String,
    status_ttl_seconds: u64,
) {
    while let Some(event) = events.recv().await {
        match &event {
            JobEvent::Active { queue, job_id, .. } => {
                tracing::debug!(queue = %queue, job_id = %job_id, "Job active");
            }
            JobEvent::Completed { queue, job_id, .. } => {
                tracing::debug!(queue = %queue, job_id = %job_id, "Job completed");
            }
            JobEvent::Retried { queue, job_id, delay_ms, .. } => {
                tracing::info!(queue = %queue, job_id = %job_id, delay_ms, "Job scheduled for retry");
            }
            JobEvent::Failed { queue, job_id, error, .. } => {
                tracing::warn!(queue = %queue, job_id = %job_id, error = %error, "Job failed permanently");
            }
            JobEvent::Stalled { queue, job_id } => {
                metrics::counter!("queue_jobs_stalled_total", "queue" => queue.clone())
                    .increment(1);
                tracing::warn!(queue = %queue, job_id = %job_id, "Job lease expired, requeued");
            }
        }

        let record = status_record(&event, &server_id);
        let key = format!("job:{}:status", record.job_id);
        cache.set(&key, &record, Some(status_ttl_seconds)).await;
    }
    tracing::debug!("Job status tracker drained");
}

fn status_record(event: &JobEvent, server_id: &str) -> JobStatusRecord {
    let updated_at = format_offset(OffsetDateTime::now_utc());
    match event {
        JobEvent::Active { queue, job_id, attempts_made } => JobStatusRecord {
            job_id: job_id.clone(),
            queue: queue.clone(),
            state: JobState::Active,
            attempts_made: *attempts_made,
            server_id: server_id.to_owned(),
            updated_at,
            error: None,
        },
        JobEvent::Completed { queue, job_id, attempts_made } => JobStatusRecord {
            job_id: job_id.clone(),
            queue: queue.clone(),
            state: JobState::Completed,
            attempts_made: *attempts_made,
            server_id: server_id.to_owned(),
            updated_at,
            error: None,
        },
        JobEvent::Retried { queue, job_id, attempts_made, error, .. } => JobStatusRecord {
            job_id: job_id.clone(),
            queue: queue.clone(),
            state: JobState::Delayed,
            attempts_made: *attempts_made,
            server_id: server_id.to_owned(),
            updated_at,
            error: Some(error.clone()),
        },
        JobEvent::Failed { queue, job_id, attempts_made, error } => JobStatusRecord {
            job_id: job_id.clone(),
            queue: queue.clone(),
            state: JobState::Failed,
            attempts_made: *attempts_made,
            server_id: server_id.to_owned(),
            updated_at,
            error: Some(error.clone()),
        },
        JobEvent::Stalled { queue, job_id } => JobStatusRecord {
            job_id: job_id.clone(),
            queue: queue.clone(),
            state: JobState::Waiting,
            attempts_made: 0,
            server_id: server_id.to_owned(),
            updated_at,
            error: None,
        },
    }
}

async fn run_maintenance_loop(
    queue: String,
    store: Arc<dyn JobStore>,
    events: mpsc::Sender<JobEvent>,
    interval_seconds: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_secs(interval_seconds.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                match store.run_maintenance(&queue).await {
                    Ok(report) => {
                        if report.promoted > 0 {
                            tracing::debug!(queue = %queue, promoted = report.promoted, "Promoted delayed jobs");
                        }
                        for job_id in report.stalled {
                            if events
                                .send(JobEvent::Stalled { queue: queue.clone(), job_id })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(queue = %queue, error = %err, "Queue maintenance failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::core::config::CacheSettings;
    use crate::core::redis::RedisHandle;

    use super::*;

    fn test_queue_settings() -> QueueSettings {
        QueueSettings {
            max_attempts: 3,
            backoff_base_ms: 100,
            completed_retention: 100,
            failed_retention: 100,
            lease_seconds: 60,
            maintenance_interval_seconds: 15,
            poll_interval_ms: 50,
            poll_jitter_ms: 0,
            drain_timeout_seconds: 30,
            job_status_ttl_seconds: 3600,
        }
    }

    fn offline_cache() -> TieredCache {
        let settings =
            CacheSettings { l1_max_entries: 256, default_ttl_seconds: 300, warm_batch_size: 50 };
        TieredCache::new(&settings, RedisHandle::new("redis://127.0.0.1:1/0".into()))
    }

    fn build_registry() -> (QueueRegistry, Arc<MemoryJobStore>, TieredCache) {
        let store = Arc::new(MemoryJobStore::new());
        let cache = offline_cache();
        let registry = QueueRegistry::new(
            store.clone() as Arc<dyn JobStore>,
            cache.clone(),
            "test-server".into(),
            test_queue_settings(),
        );
        (registry, store, cache)
    }

    struct Echo;

    #[async_trait]
    impl JobProcessor for Echo {
        async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
            Ok(job.payload.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_job_is_processed_and_status_is_queryable() {
        let (registry, _store, _cache) = build_registry();
        registry.worker("publish", Arc::new(Echo), 2);

        let enqueued = registry
            .add_job("publish", "chunk", serde_json::json!({"n": 7}), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(enqueued.status, EnqueueStatus::Enqueued);

        let outcome =
            registry.wait_for_finished(&enqueued.id, Duration::from_secs(60)).await.unwrap();
        match outcome {
            Some(JobOutcome::Completed { result }) => assert_eq!(result["n"], 7),
            other => panic!("expected completion, got {other:?}"),
        }

        // Close drains the status tracker, so the cached record is final.
        registry.close().await;

        let status = registry.job_status(&enqueued.id).await.expect("status present");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.server_id, "test-server");
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_enqueue_staggers_delays_and_records_the_manifest() {
        let (registry, store, cache) = build_registry();

        let jobs: Vec<NewJob> = (0..3)
            .map(|i| NewJob {
                name: "chunk".into(),
                payload: serde_json::json!({"chunk_index": i}),
                opts: JobOptions {
                    job_id: Some(format!("bulk-publish-e1-chunk-{i}")),
                    priority: Some(1),
                    ..JobOptions::default()
                },
            })
            .collect();

        let report = registry
            .add_bulk_jobs(
                "publish",
                jobs,
                BulkOptions { batch_size: 2, stagger_delay_ms: 200 },
            )
            .await
            .unwrap();

        assert_eq!(report.enqueued, 3);
        assert_eq!(report.duplicates, 0);
        assert_eq!(
            report.job_ids,
            ["bulk-publish-e1-chunk-0", "bulk-publish-e1-chunk-1", "bulk-publish-e1-chunk-2"]
        );

        for (i, id) in report.job_ids.iter().enumerate() {
            let job = store.job(id).await.unwrap().unwrap();
            assert_eq!(job.delay_ms, i as u64 * 200, "job {id}");
            assert_eq!(job.priority, 1);
        }

        let manifest: Vec<String> =
            cache.get(&format!("batch:{}", report.batch_id)).await.expect("manifest cached");
        assert_eq!(manifest, report.job_ids);

        registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn re_dispatch_with_deterministic_ids_is_idempotent() {
        let (registry, _store, _cache) = build_registry();

        let make_jobs = || {
            vec![NewJob {
                name: "chunk".into(),
                payload: serde_json::json!({}),
                opts: JobOptions {
                    job_id: Some("bulk-publish-e9-chunk-0".into()),
                    ..JobOptions::default()
                },
            }]
        };

        let first =
            registry.add_bulk_jobs("publish", make_jobs(), BulkOptions::default()).await.unwrap();
        let second =
            registry.add_bulk_jobs("publish", make_jobs(), BulkOptions::default()).await.unwrap();

        assert_eq!(first.enqueued, 1);
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.duplicates, 1);

        registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn job_status_prefers_the_cached_record() {
        let (registry, _store, cache) = build_registry();

        let seeded = JobStatusRecord {
            job_id: "ghost".into(),
            queue: "publish".into(),
            state: JobState::Active,
            attempts_made: 1,
            server_id: "another-server".into(),
            updated_at: "2025-01-02T10:20:30Z".into(),
            error: None,
        };
        cache.set("job:ghost:status", &seeded, None).await;

        // The broker has no such job; only the cache can answer.
        let status = registry.job_status("ghost").await.expect("cached status");
        assert_eq!(status.server_id, "another-server");
        assert_eq!(status.state, JobState::Active);

        registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn worker_registration_is_idempotent() {
        let (registry, _store, _cache) = build_registry();
        assert!(registry.worker("publish", Arc::new(Echo), 1));
        assert!(!registry.worker("publish", Arc::new(Echo), 1));
        registry.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_reports_health_after() {
        let (registry, _store, _cache) = build_registry();
        registry.worker("publish", Arc::new(Echo), 2);

        registry.close().await;
        registry.close().await;

        let health = registry.health_check().await;
        assert!(health.broker_reachable, "memory store stays reachable");
        assert!(health.queues.contains_key("publish"));
    }
}
