use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Duration;

use crate::core::config::QueueSettings;
use crate::core::redis::RedisHandle;
use crate::core::time::now_epoch_ms;

use super::job::{EnqueueStatus, Job, JobOutcome, JobState, QueueCounts};
use super::store::{FailDisposition, JobStore, MaintenanceReport, QueueError};

/// Waiting-set score packs priority and arrival order into one number:
/// `priority * SEQ_SPAN + seq`. Priority dominates, ties break FIFO.
const SEQ_SPAN: i64 = 1_000_000_000_000;

/// Promotes due delayed jobs into the waiting set, then pops the best waiting
/// job and leases it. KEYS: waiting, delayed, active. ARGV: now_ms,
/// lease_until_ms, server_id.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    local wscore = redis.call('HGET', 'job:' .. id, 'wscore')
    if wscore then
        redis.call('HSET', 'job:' .. id, 'state', 'waiting')
        redis.call('ZADD', KEYS[1], tonumber(wscore), id)
    end
end
local ids = redis.call('ZRANGE', KEYS[1], 0, 0)
if #ids == 0 then
    return false
end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[3], ARGV[2], id)
redis.call('HINCRBY', 'job:' .. id, 'attempts_made', 1)
redis.call('HSET', 'job:' .. id, 'state', 'active', 'claimed_by', ARGV[3])
return id
"#;

/// Same delayed promotion as the claim path, plus requeue of active leases
/// that expired (their worker is presumed dead). KEYS: waiting, delayed,
/// active. ARGV: now_ms.
const MAINTENANCE_SCRIPT: &str = r#"
local promoted = 0
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 200)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    local wscore = redis.call('HGET', 'job:' .. id, 'wscore')
    if wscore then
        redis.call('HSET', 'job:' .. id, 'state', 'waiting')
        redis.call('ZADD', KEYS[1], tonumber(wscore), id)
        promoted = promoted + 1
    end
end
local stalled = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, 200)
for _, id in ipairs(stalled) do
    redis.call('ZREM', KEYS[3], id)
    local wscore = redis.call('HGET', 'job:' .. id, 'wscore')
    if wscore then
        redis.call('HSET', 'job:' .. id, 'state', 'waiting')
        redis.call('ZADD', KEYS[1], tonumber(wscore), id)
    end
end
return {promoted, stalled}
"#;

/// Shared broker backing over Redis. Job bodies live in `job:<id>` hashes;
/// each queue keeps waiting/delayed zsets, an active-lease zset and bounded
/// completed/failed retention lists. Finishing a job pushes onto
/// `job:<id>:done` so waiters block on BLPOP instead of polling.
pub struct RedisJobStore {
    redis: RedisHandle,
    lease_seconds: u64,
    completed_retention: usize,
    failed_retention: usize,
    record_ttl_seconds: u64,
    claim_script: redis::Script,
    maintenance_script: redis::Script,
}

impl RedisJobStore {
    pub fn new(redis: RedisHandle, settings: &QueueSettings) -> Self {
        Self {
            redis,
            lease_seconds: settings.lease_seconds,
            completed_retention: settings.completed_retention,
            failed_retention: settings.failed_retention,
            record_ttl_seconds: settings.job_status_ttl_seconds,
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            maintenance_script: redis::Script::new(MAINTENANCE_SCRIPT),
        }
    }

    async fn manager(&self) -> Result<ConnectionManager, QueueError> {
        self.redis.manager().await.ok_or(QueueError::Unavailable)
    }
}

fn job_key(id: &str) -> String {
    format!("job:{id}")
}

fn done_key(id: &str) -> String {
    format!("job:{id}:done")
}

fn waiting_key(queue: &str) -> String {
    format!("queue:{queue}:waiting")
}

fn delayed_key(queue: &str) -> String {
    format!("queue:{queue}:delayed")
}

fn active_key(queue: &str) -> String {
    format!("queue:{queue}:active")
}

fn completed_key(queue: &str) -> String {
    format!("queue:{queue}:completed")
}

fn failed_key(queue: &str) -> String {
    format!("queue:{queue}:failed")
}

fn seq_key(queue: &str) -> String {
    format!("queue:{queue}:seq")
}

fn required<T: FromStr>(
    map: &HashMap<String, String>,
    field: &'static str,
    job_id: &str,
) -> Result<T, QueueError> {
    map.get(field).and_then(|raw| raw.parse().ok()).ok_or_else(|| QueueError::Corrupt {
        job_id: job_id.to_owned(),
        reason: format!("missing or invalid field {field}"),
    })
}

fn job_from_hash(job_id: &str, map: &HashMap<String, String>) -> Result<Job, QueueError> {
    let state_raw: String = required(map, "state", job_id)?;
    let state = JobState::parse(&state_raw).ok_or_else(|| QueueError::Corrupt {
        job_id: job_id.to_owned(),
        reason: format!("unknown state {state_raw}"),
    })?;

    let payload = match map.get("payload") {
        Some(raw) => serde_json::from_str(raw).map_err(|err| QueueError::Corrupt {
            job_id: job_id.to_owned(),
            reason: format!("payload is not valid JSON: {err}"),
        })?,
        None => serde_json::Value::Null,
    };

    Ok(Job {
        id: job_id.to_owned(),
        queue_name: required(map, "queue", job_id)?,
        name: required(map, "name", job_id)?,
        payload,
        priority: required(map, "priority", job_id)?,
        delay_ms: required(map, "delay_ms", job_id)?,
        attempts_made: required(map, "attempts_made", job_id)?,
        max_attempts: required(map, "max_attempts", job_id)?,
        backoff_base_ms: required(map, "backoff_base_ms", job_id)?,
        state,
        enqueued_at_ms: required(map, "enqueued_at_ms", job_id)?,
        claimed_by: map.get("claimed_by").cloned(),
        error: map.get("error").cloned(),
        result: map.get("result").and_then(|raw| serde_json::from_str(raw).ok()),
    })
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, job: &Job) -> Result<EnqueueStatus, QueueError> {
        let mut conn = self.manager().await?;
        let jk = job_key(&job.id);

        // HSETNX decides a single winner when two processes race on the same
        // deterministic id.
        let created: bool = conn.hset_nx(&jk, "id", &job.id).await?;
        if !created {
            return Ok(EnqueueStatus::AlreadyExists);
        }

        let seq: i64 = conn.incr(seq_key(&job.queue_name), 1).await?;
        let wscore = job.priority * SEQ_SPAN + seq;
        let state = if job.delay_ms > 0 { JobState::Delayed } else { JobState::Waiting };

        let fields: Vec<(&str, String)> = vec![
            ("queue", job.queue_name.clone()),
            ("name", job.name.clone()),
            ("payload", job.payload.to_string()),
            ("priority", job.priority.to_string()),
            ("wscore", wscore.to_string()),
            ("delay_ms", job.delay_ms.to_string()),
            ("attempts_made", "0".to_owned()),
            ("max_attempts", job.max_attempts.to_string()),
            ("backoff_base_ms", job.backoff_base_ms.to_string()),
            ("state", state.as_str().to_owned()),
            ("enqueued_at_ms", job.enqueued_at_ms.to_string()),
        ];

        let mut pipe = redis::pipe();
        pipe.hset_multiple(&jk, &fields).ignore();
        if job.delay_ms > 0 {
            let ready_at = job.enqueued_at_ms + job.delay_ms as i64;
            pipe.zadd(delayed_key(&job.queue_name), &job.id, ready_at).ignore();
        } else {
            pipe.zadd(waiting_key(&job.queue_name), &job.id, wscore).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(EnqueueStatus::Enqueued)
    }

    async fn claim(&self, queue: &str, server_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.manager().await?;
        let now = now_epoch_ms();
        let lease_until = now + (self.lease_seconds * 1000) as i64;

        let claimed: Option<String> = self
            .claim_script
            .key(waiting_key(queue))
            .key(delayed_key(queue))
            .key(active_key(queue))
            .arg(now)
            .arg(lease_until)
            .arg(server_id)
            .invoke_async(&mut conn)
            .await?;

        let Some(job_id) = claimed else { return Ok(None) };
        let map: HashMap<String, String> = conn.hgetall(job_key(&job_id)).await?;
        if map.is_empty() {
            return Err(QueueError::Corrupt {
                job_id,
                reason: "claimed id has no job record".to_owned(),
            });
        }
        job_from_hash(&job_id, &map).map(Some)
    }

    async fn complete(&self, job: &Job, result: serde_json::Value) -> Result<(), QueueError> {
        let mut conn = self.manager().await?;
        let jk = job_key(&job.id);
        let dk = done_key(&job.id);

        let mut pipe = redis::pipe();
        pipe.hset_multiple(
            &jk,
            &[
                ("state", JobState::Completed.as_str().to_owned()),
                ("result", result.to_string()),
                ("finished_at_ms", now_epoch_ms().to_string()),
            ],
        )
        .ignore();
        pipe.zrem(active_key(&job.queue_name), &job.id).ignore();
        if self.completed_retention > 0 {
            let ck = completed_key(&job.queue_name);
            pipe.lpush(&ck, &job.id).ignore();
            pipe.ltrim(&ck, 0, self.completed_retention as isize - 1).ignore();
        }
        pipe.lpush(&dk, JobState::Completed.as_str()).ignore();
        pipe.expire(&jk, self.record_ttl_seconds as i64).ignore();
        pipe.expire(&dk, self.record_ttl_seconds as i64).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailDisposition, QueueError> {
        let mut conn = self.manager().await?;
        let jk = job_key(&job.id);

        if job.attempts_exhausted() {
            let dk = done_key(&job.id);
            let mut pipe = redis::pipe();
            pipe.hset_multiple(
                &jk,
                &[
                    ("state", JobState::Failed.as_str().to_owned()),
                    ("error", error.to_owned()),
                    ("finished_at_ms", now_epoch_ms().to_string()),
                ],
            )
            .ignore();
            pipe.zrem(active_key(&job.queue_name), &job.id).ignore();
            if self.failed_retention > 0 {
                let fk = failed_key(&job.queue_name);
                pipe.lpush(&fk, &job.id).ignore();
                pipe.ltrim(&fk, 0, self.failed_retention as isize - 1).ignore();
            }
            pipe.lpush(&dk, JobState::Failed.as_str()).ignore();
            pipe.expire(&jk, self.record_ttl_seconds as i64).ignore();
            pipe.expire(&dk, self.record_ttl_seconds as i64).ignore();
            pipe.query_async::<_, ()>(&mut conn).await?;
            return Ok(FailDisposition::Exhausted);
        }

        let delay_ms = job.retry_delay_ms();
        let ready_at = now_epoch_ms() + delay_ms as i64;
        let mut pipe = redis::pipe();
        pipe.hset_multiple(
            &jk,
            &[
                ("state", JobState::Delayed.as_str().to_owned()),
                ("error", error.to_owned()),
            ],
        )
        .ignore();
        pipe.zrem(active_key(&job.queue_name), &job.id).ignore();
        pipe.zadd(delayed_key(&job.queue_name), &job.id, ready_at).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(FailDisposition::Retried { delay_ms })
    }

    async fn job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.manager().await?;
        let map: HashMap<String, String> = conn.hgetall(job_key(job_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        job_from_hash(job_id, &map).map(Some)
    }

    async fn wait_for_finished(
        &self,
        job_id: &str,
        ceiling: Duration,
    ) -> Result<Option<JobOutcome>, QueueError> {
        if let Some(job) = self.job(job_id).await? {
            match job.state {
                JobState::Completed => {
                    return Ok(Some(JobOutcome::Completed {
                        result: job.result.unwrap_or(serde_json::Value::Null),
                    }));
                }
                JobState::Failed => {
                    return Ok(Some(JobOutcome::Failed {
                        error: job.error.unwrap_or_else(|| "unknown failure".to_owned()),
                    }));
                }
                _ => {}
            }
        }

        // BLPOP would stall every caller sharing the multiplexed connection,
        // so waiting gets a connection of its own.
        let mut conn = self.redis.blocking_connection().await.map_err(QueueError::Redis)?;
        let timeout_secs = ceiling.as_secs_f64().max(0.001);
        let popped: Option<(String, String)> = conn.blpop(done_key(job_id), timeout_secs).await?;
        let Some((_, terminal)) = popped else { return Ok(None) };

        match self.job(job_id).await? {
            Some(job) if job.state == JobState::Completed => Ok(Some(JobOutcome::Completed {
                result: job.result.unwrap_or(serde_json::Value::Null),
            })),
            Some(job) if job.state == JobState::Failed => Ok(Some(JobOutcome::Failed {
                error: job.error.unwrap_or_else(|| "unknown failure".to_owned()),
            })),
            // The record expired between the signal and the read; fall back
            // to the signal itself.
            _ if terminal == JobState::Completed.as_str() => {
                Ok(Some(JobOutcome::Completed { result: serde_json::Value::Null }))
            }
            _ => Ok(Some(JobOutcome::Failed { error: "job record expired".to_owned() })),
        }
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let mut conn = self.manager().await?;
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .zcard(waiting_key(queue))
                .zcard(delayed_key(queue))
                .zcard(active_key(queue))
                .llen(completed_key(queue))
                .llen(failed_key(queue))
                .query_async(&mut conn)
                .await?;
        Ok(QueueCounts { waiting, delayed, active, completed, failed })
    }

    async fn run_maintenance(&self, queue: &str) -> Result<MaintenanceReport, QueueError> {
        let mut conn = self.manager().await?;
        let (promoted, stalled): (u64, Vec<String>) = self
            .maintenance_script
            .key(waiting_key(queue))
            .key(delayed_key(queue))
            .key(active_key(queue))
            .arg(now_epoch_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(MaintenanceReport { promoted, stalled })
    }

    async fn ping(&self) -> bool {
        self.redis.is_reachable().await
    }

    async fn close(&self) {
        self.redis.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_hash() -> HashMap<String, String> {
        [
            ("queue", "bulk-publish"),
            ("name", "publish-chunk"),
            ("payload", r#"{"exam_id":"e1","chunk_index":0}"#),
            ("priority", "1"),
            ("delay_ms", "200"),
            ("attempts_made", "1"),
            ("max_attempts", "3"),
            ("backoff_base_ms", "1000"),
            ("state", "active"),
            ("enqueued_at_ms", "1735819230000"),
            ("claimed_by", "srv-1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    #[test]
    fn job_parses_from_a_complete_hash() {
        let job = job_from_hash("bulk-publish-e1-chunk-0", &full_hash()).unwrap();
        assert_eq!(job.queue_name, "bulk-publish");
        assert_eq!(job.priority, 1);
        assert_eq!(job.delay_ms, 200);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.claimed_by.as_deref(), Some("srv-1"));
        assert_eq!(job.payload["exam_id"], "e1");
    }

    #[test]
    fn missing_required_field_is_reported_as_corrupt() {
        let mut map = full_hash();
        map.remove("max_attempts");
        let err = job_from_hash("j1", &map).unwrap_err();
        assert!(matches!(err, QueueError::Corrupt { .. }));
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn unknown_state_is_reported_as_corrupt() {
        let mut map = full_hash();
        map.insert("state".to_owned(), "paused".to_owned());
        let err = job_from_hash("j1", &map).unwrap_err();
        assert!(err.to_string().contains("paused"));
    }
}
