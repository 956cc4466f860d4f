use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration, Instant};

use super::job::{Job, JobEvent};
use super::store::{FailDisposition, JobStore};

/// Executes one claimed job. Returning `Err` hands the job back to the
/// broker's retry policy; the returned value is stored as the job's result.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value>;
}

#[derive(Clone)]
pub(crate) struct WorkerConfig {
    pub(crate) queue: String,
    pub(crate) server_id: String,
    pub(crate) poll_interval_ms: u64,
    pub(crate) poll_jitter_ms: u64,
}

/// Claim-process loop. One instance per unit of worker concurrency; idle
/// polls are jittered so a fleet of workers does not hammer the broker in
/// lockstep.
pub(crate) async fn run_worker_loop(
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    events: mpsc::Sender<JobEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match store.claim(&config.queue, &config.server_id).await {
            Ok(Some(job)) => {
                process_claimed(&config, store.as_ref(), processor.as_ref(), &events, job).await;
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(queue = %config.queue, error = %err, "Failed to claim job");
            }
        }

        let idle = idle_delay(&config);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(idle) => {}
        }
    }
}

fn idle_delay(config: &WorkerConfig) -> Duration {
    let jitter = if config.poll_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=config.poll_jitter_ms)
    } else {
        0
    };
    Duration::from_millis(config.poll_interval_ms + jitter)
}

async fn process_claimed(
    config: &WorkerConfig,
    store: &dyn JobStore,
    processor: &dyn JobProcessor,
    events: &mpsc::Sender<JobEvent>,
    job: Job,
) {
    emit(
        events,
        JobEvent::Active {
            queue: job.queue_name.clone(),
            job_id: job.id.clone(),
            attempts_made: job.attempts_made,
        },
    )
    .await;

    let started = Instant::now();
    match processor.process(&job).await {
        Ok(result) => {
            if let Err(err) = store.complete(&job, result).await {
                // The lease expires and maintenance requeues the job.
                tracing::error!(job_id = %job.id, error = %err, "Failed to record job completion");
                return;
            }
            metrics::counter!("queue_jobs_completed_total", "queue" => config.queue.clone())
                .increment(1);
            metrics::histogram!("queue_job_duration_seconds", "queue" => config.queue.clone())
                .record(started.elapsed().as_secs_f64());
            emit(
                events,
                JobEvent::Completed {
                    queue: job.queue_name.clone(),
                    job_id: job.id.clone(),
                    attempts_made: job.attempts_made,
                },
            )
            .await;
        }
        Err(err) => {
            let message = format!("{err:#}");
            tracing::warn!(
                job_id = %job.id,
                queue = %config.queue,
                attempt = job.attempts_made,
                error = %err,
                "Job attempt failed"
            );
            match store.fail(&job, &message).await {
                Ok(FailDisposition::Retried { delay_ms }) => {
                    metrics::counter!("queue_jobs_retried_total", "queue" => config.queue.clone())
                        .increment(1);
                    emit(
                        events,
                        JobEvent::Retried {
                            queue: job.queue_name.clone(),
                            job_id: job.id.clone(),
                            attempts_made: job.attempts_made,
                            delay_ms,
                            error: message,
                        },
                    )
                    .await;
                }
                Ok(FailDisposition::Exhausted) => {
                    metrics::counter!("queue_jobs_failed_total", "queue" => config.queue.clone())
                        .increment(1);
                    emit(
                        events,
                        JobEvent::Failed {
                            queue: job.queue_name.clone(),
                            job_id: job.id.clone(),
                            attempts_made: job.attempts_made,
                            error: message,
                        },
                    )
                    .await;
                }
                Err(store_err) => {
                    tracing::error!(job_id = %job.id, error = %store_err, "Failed to record job failure");
                }
            }
        }
    }
}

async fn emit(events: &mpsc::Sender<JobEvent>, event: JobEvent) {
    if events.send(event).await.is_err() {
        tracing::debug!("Job event channel closed, dropping event");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::super::job::{JobOutcome, JobState};
    use super::super::memory_store::MemoryJobStore;
    use super::*;

    struct CountingProcessor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobProcessor for CountingProcessor {
        async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"echo": job.payload}))
        }
    }

    struct AlwaysFailing;

    #[async_trait]
    impl JobProcessor for AlwaysFailing {
        async fn process(&self, _job: &Job) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("result store refused the write")
        }
    }

    fn waiting_job(id: &str, max_attempts: u32) -> Job {
        Job {
            id: id.into(),
            queue_name: "q".into(),
            name: "test".into(),
            payload: serde_json::json!({"n": 1}),
            priority: 0,
            delay_ms: 0,
            attempts_made: 0,
            max_attempts,
            backoff_base_ms: 100,
            state: JobState::Waiting,
            enqueued_at_ms: 0,
            claimed_by: None,
            error: None,
            result: None,
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            queue: "q".into(),
            server_id: "test-server".into(),
            poll_interval_ms: 50,
            poll_jitter_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_drains_waiting_jobs_and_stops_on_shutdown() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(&waiting_job("a", 3)).await.unwrap();
        store.enqueue(&waiting_job("b", 3)).await.unwrap();

        let processor = Arc::new(CountingProcessor { calls: AtomicU32::new(0) });
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_worker_loop(
            config(),
            store.clone() as Arc<dyn JobStore>,
            processor.clone() as Arc<dyn JobProcessor>,
            events_tx,
            shutdown_rx,
        ));

        for id in ["a", "b"] {
            let outcome = store.wait_for_finished(id, Duration::from_secs(60)).await.unwrap();
            assert!(matches!(outcome, Some(JobOutcome::Completed { .. })), "job {id}");
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);

        let mut active = 0;
        let mut completed = 0;
        while let Ok(event) = events_rx.try_recv() {
            match event {
                JobEvent::Active { .. } => active += 1,
                JobEvent::Completed { .. } => completed += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!((active, completed), (2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_is_retried_with_backoff_then_exhausted() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(&waiting_job("doomed", 2)).await.unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_worker_loop(
            config(),
            store.clone() as Arc<dyn JobStore>,
            Arc::new(AlwaysFailing) as Arc<dyn JobProcessor>,
            events_tx,
            shutdown_rx,
        ));

        let outcome = store.wait_for_finished("doomed", Duration::from_secs(60)).await.unwrap();
        match outcome {
            Some(JobOutcome::Failed { error }) => {
                assert!(error.contains("result store refused the write"));
            }
            other => panic!("expected failed outcome, got {other:?}"),
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let job = store.job("doomed").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);

        let mut retried = 0;
        let mut failed = 0;
        while let Ok(event) = events_rx.try_recv() {
            match event {
                JobEvent::Active { .. } => {}
                JobEvent::Retried { delay_ms, .. } => {
                    assert_eq!(delay_ms, 100);
                    retried += 1;
                }
                JobEvent::Failed { attempts_made, .. } => {
                    assert_eq!(attempts_made, 2);
                    failed += 1;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!((retried, failed), (1, 1));
    }
}
