use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use super::job::{EnqueueStatus, Job, JobOutcome, JobState, QueueCounts};
use super::store::{FailDisposition, JobStore, MaintenanceReport, QueueError};

/// Single-process broker backing for development and tests. Scheduling runs
/// on the tokio clock so paused-time tests drive delays deterministically.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
    seq: AtomicU64,
}

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<String, StoredJob>,
    signals: HashMap<String, Arc<Notify>>,
}

struct StoredJob {
    job: Job,
    seq: u64,
    ready_at: Instant,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminal_outcome(job: &Job) -> Option<JobOutcome> {
        match job.state {
            JobState::Completed => Some(JobOutcome::Completed {
                result: job.result.clone().unwrap_or(serde_json::Value::Null),
            }),
            JobState::Failed => Some(JobOutcome::Failed {
                error: job.error.clone().unwrap_or_else(|| "unknown failure".into()),
            }),
            _ => None,
        }
    }

    fn terminal(&self, job_id: &str) -> Option<JobOutcome> {
        let inner = self.lock();
        inner.jobs.get(job_id).and_then(|stored| Self::terminal_outcome(&stored.job))
    }

    fn signal(&self, job_id: &str) -> Arc<Notify> {
        let mut inner = self.lock();
        inner.signals.entry(job_id.to_owned()).or_default().clone()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: &Job) -> Result<EnqueueStatus, QueueError> {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&job.id) {
            return Ok(EnqueueStatus::AlreadyExists);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let ready_at = Instant::now() + Duration::from_millis(job.delay_ms);
        inner.jobs.insert(job.id.clone(), StoredJob { job: job.clone(), seq, ready_at });
        Ok(EnqueueStatus::Enqueued)
    }

    async fn claim(&self, queue: &str, server_id: &str) -> Result<Option<Job>, QueueError> {
        let now = Instant::now();
        let mut inner = self.lock();

        let best = inner
            .jobs
            .values()
            .filter(|stored| stored.job.queue_name == queue)
            .filter(|stored| match stored.job.state {
                JobState::Waiting => true,
                JobState::Delayed => stored.ready_at <= now,
                _ => false,
            })
            .min_by_key(|stored| (stored.job.priority, stored.seq))
            .map(|stored| stored.job.id.clone());

        let Some(id) = best else { return Ok(None) };
        let Some(stored) = inner.jobs.get_mut(&id) else { return Ok(None) };
        stored.job.state = JobState::Active;
        stored.job.attempts_made += 1;
        stored.job.claimed_by = Some(server_id.to_owned());
        Ok(Some(stored.job.clone()))
    }

    async fn complete(&self, job: &Job, result: serde_json::Value) -> Result<(), QueueError> {
        let signal = {
            let mut inner = self.lock();
            if let Some(stored) = inner.jobs.get_mut(&job.id) {
                stored.job.state = JobState::Completed;
                stored.job.result = Some(result);
                stored.job.error = None;
            }
            inner.signals.entry(job.id.clone()).or_default().clone()
        };
        signal.notify_waiters();
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailDisposition, QueueError> {
        if job.attempts_exhausted() {
            let signal = {
                let mut inner = self.lock();
                if let Some(stored) = inner.jobs.get_mut(&job.id) {
                    stored.job.state = JobState::Failed;
                    stored.job.error = Some(error.to_owned());
                }
                inner.signals.entry(job.id.clone()).or_default().clone()
            };
            signal.notify_waiters();
            return Ok(FailDisposition::Exhausted);
        }

        let delay_ms = job.retry_delay_ms();
        let mut inner = self.lock();
        if let Some(stored) = inner.jobs.get_mut(&job.id) {
            stored.job.state = JobState::Delayed;
            stored.job.error = Some(error.to_owned());
            stored.ready_at = Instant::now() + Duration::from_millis(delay_ms);
        }
        Ok(FailDisposition::Retried { delay_ms })
    }

    async fn job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let inner = self.lock();
        Ok(inner.jobs.get(job_id).map(|stored| stored.job.clone()))
    }

    async fn wait_for_finished(
        &self,
        job_id: &str,
        ceiling: Duration,
    ) -> Result<Option<JobOutcome>, QueueError> {
        if let Some(outcome) = self.terminal(job_id) {
            return Ok(Some(outcome));
        }

        let signal = self.signal(job_id);
        let notified = signal.notified();
        tokio::pin!(notified);
        // Register as a waiter before re-checking, otherwise a completion
        // racing this call could signal before anyone listens.
        notified.as_mut().enable();
        if let Some(outcome) = self.terminal(job_id) {
            return Ok(Some(outcome));
        }

        match tokio::time::timeout(ceiling, notified).await {
            Ok(()) => Ok(self.terminal(job_id)),
            Err(_) => Ok(None),
        }
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let inner = self.lock();
        let mut counts = QueueCounts::default();
        for stored in inner.jobs.values().filter(|stored| stored.job.queue_name == queue) {
            match stored.job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn run_maintenance(&self, queue: &str) -> Result<MaintenanceReport, QueueError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut report = MaintenanceReport::default();
        for stored in inner.jobs.values_mut().filter(|stored| stored.job.queue_name == queue) {
            if stored.job.state == JobState::Delayed && stored.ready_at <= now {
                stored.job.state = JobState::Waiting;
                report.promoted += 1;
            }
        }
        Ok(report)
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(id: &str, queue: &str, priority: i64, delay_ms: u64) -> Job {
        Job {
            id: id.into(),
            queue_name: queue.into(),
            name: "test".into(),
            payload: serde_json::json!({"id": id}),
            priority,
            delay_ms,
            attempts_made: 0,
            max_attempts: 2,
            backoff_base_ms: 1000,
            state: if delay_ms > 0 { JobState::Delayed } else { JobState::Waiting },
            enqueued_at_ms: 0,
            claimed_by: None,
            error: None,
            result: None,
        }
    }

    #[tokio::test]
    async fn claim_prefers_smaller_priority_then_enqueue_order() {
        let store = MemoryJobStore::new();
        store.enqueue(&new_job("low", "q", 2, 0)).await.unwrap();
        store.enqueue(&new_job("hi-first", "q", 1, 0)).await.unwrap();
        store.enqueue(&new_job("hi-second", "q", 1, 0)).await.unwrap();

        let order: Vec<String> = [
            store.claim("q", "s1").await.unwrap().unwrap().id,
            store.claim("q", "s1").await.unwrap().unwrap().id,
            store.claim("q", "s1").await.unwrap().unwrap().id,
        ]
        .into();
        assert_eq!(order, ["hi-first", "hi-second", "low"]);
        assert!(store.claim("q", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_marks_active_and_counts_the_attempt() {
        let store = MemoryJobStore::new();
        store.enqueue(&new_job("j", "q", 0, 0)).await.unwrap();

        let claimed = store.claim("q", "server-a").await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);
        assert_eq!(claimed.claimed_by.as_deref(), Some("server-a"));
    }

    #[tokio::test]
    async fn duplicate_job_id_is_a_noop() {
        let store = MemoryJobStore::new();
        assert_eq!(store.enqueue(&new_job("j", "q", 0, 0)).await.unwrap(), EnqueueStatus::Enqueued);
        assert_eq!(
            store.enqueue(&new_job("j", "q", 0, 0)).await.unwrap(),
            EnqueueStatus::AlreadyExists
        );
        assert_eq!(store.counts("q").await.unwrap().waiting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_becomes_claimable_after_its_delay() {
        let store = MemoryJobStore::new();
        store.enqueue(&new_job("j", "q", 0, 200)).await.unwrap();

        assert!(store.claim("q", "s1").await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(201)).await;
        assert!(store.claim("q", "s1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_retries_with_backoff_then_exhausts() {
        let store = MemoryJobStore::new();
        store.enqueue(&new_job("j", "q", 0, 0)).await.unwrap();

        let first = store.claim("q", "s1").await.unwrap().unwrap();
        let disposition = store.fail(&first, "write refused").await.unwrap();
        assert_eq!(disposition, FailDisposition::Retried { delay_ms: 1000 });
        assert!(store.claim("q", "s1").await.unwrap().is_none(), "backoff not elapsed yet");

        tokio::time::advance(Duration::from_millis(1001)).await;
        let second = store.claim("q", "s1").await.unwrap().unwrap();
        assert_eq!(second.attempts_made, 2);

        let disposition = store.fail(&second, "write refused").await.unwrap();
        assert_eq!(disposition, FailDisposition::Exhausted);
        let job = store.job("j").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("write refused"));
    }

    #[tokio::test]
    async fn wait_returns_immediately_for_already_finished_jobs() {
        let store = MemoryJobStore::new();
        store.enqueue(&new_job("j", "q", 0, 0)).await.unwrap();
        let claimed = store.claim("q", "s1").await.unwrap().unwrap();
        store.complete(&claimed, serde_json::json!({"success": 10})).await.unwrap();

        let outcome = store.wait_for_finished("j", Duration::from_secs(300)).await.unwrap();
        match outcome {
            Some(JobOutcome::Completed { result }) => {
                assert_eq!(result, serde_json::json!({"success": 10}));
            }
            other => panic!("expected completed outcome, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_wakes_on_the_completion_signal() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(&new_job("j", "q", 0, 0)).await.unwrap();

        let finisher = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let claimed = store.claim("q", "s1").await.unwrap().unwrap();
                store.complete(&claimed, serde_json::Value::Null).await.unwrap();
            })
        };

        let outcome = store.wait_for_finished("j", Duration::from_secs(300)).await.unwrap();
        assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
        finisher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_at_the_ceiling() {
        let store = MemoryJobStore::new();
        store.enqueue(&new_job("j", "q", 0, 0)).await.unwrap();

        let outcome = store.wait_for_finished("j", Duration::from_secs(1)).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_promotes_due_delayed_jobs() {
        let store = MemoryJobStore::new();
        store.enqueue(&new_job("j", "q", 0, 500)).await.unwrap();
        assert_eq!(store.counts("q").await.unwrap().delayed, 1);

        tokio::time::advance(Duration::from_millis(501)).await;
        let report = store.run_maintenance("q").await.unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(store.counts("q").await.unwrap().waiting, 1);
    }
}
