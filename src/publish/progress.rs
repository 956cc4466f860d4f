use std::collections::HashMap;
use std::str::FromStr;

use crate::cache::TieredCache;
use crate::core::time::now_epoch_ms;

use super::types::{progress_key, ProgressRecord};

/// Records fan-out/fan-in progress for publish runs. Every update is a single
/// atomic hash operation against the shared cache tier, so chunk workers on
/// any process can finish simultaneously without losing increments. While the
/// shared tier is down the tracker merges under the local tier's lock, which
/// is atomic within the only scope degraded mode can see: this process.
#[derive(Clone)]
pub struct ProgressTracker {
    cache: TieredCache,
    ttl_seconds: u64,
}

impl ProgressTracker {
    pub fn new(cache: TieredCache, ttl_seconds: u64) -> Self {
        Self { cache, ttl_seconds }
    }

    /// Folds one resolved chunk into the exam's progress record, creating the
    /// record on the first call. `completed_chunks` only ever moves up.
    pub async fn record_chunk(
        &self,
        exam_id: &str,
        total_chunks: u32,
        success: u64,
        errors: u64,
    ) {
        let key = progress_key(exam_id);
        let now = now_epoch_ms();

        let applied = self
            .cache
            .hash_apply(
                &key,
                &[
                    ("exam_id", exam_id.to_owned()),
                    ("total_chunks", total_chunks.to_string()),
                    ("start_time", now.to_string()),
                ],
                &[
                    ("completed_chunks", 1),
                    ("total_success", success as i64),
                    ("total_errors", errors as i64),
                ],
                &[("last_update", now.to_string())],
                self.ttl_seconds,
            )
            .await;

        if !applied {
            self.cache.merge_local(&key, self.ttl_seconds, |previous: Option<ProgressRecord>| {
                let mut record = previous.unwrap_or_else(|| ProgressRecord {
                    exam_id: exam_id.to_owned(),
                    total_chunks,
                    start_time: now,
                    ..ProgressRecord::default()
                });
                record.completed_chunks += 1;
                record.total_success += success;
                record.total_errors += errors;
                record.last_update = now;
                record
            });
        }
    }

    /// Pure read for client polling. `None` until the first chunk finishes or
    /// after the record's TTL reaped a stalled run.
    pub async fn read(&self, exam_id: &str) -> Option<ProgressRecord> {
        let key = progress_key(exam_id);
        if let Some(fields) = self.cache.hash_get_all(&key).await {
            return decode_record(exam_id, &fields);
        }
        self.cache.local_get(&key)
    }
}

fn decode_record(exam_id: &str, fields: &HashMap<String, String>) -> Option<ProgressRecord> {
    Some(ProgressRecord {
        exam_id: fields.get("exam_id").cloned().unwrap_or_else(|| exam_id.to_owned()),
        total_chunks: field(fields, "total_chunks")?,
        completed_chunks: field(fields, "completed_chunks")?,
        total_success: field(fields, "total_success").unwrap_or(0),
        total_errors: field(fields, "total_errors").unwrap_or(0),
        start_time: field(fields, "start_time").unwrap_or(0),
        last_update: field(fields, "last_update").unwrap_or(0),
    })
}

fn field<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Option<T> {
    fields.get(name).and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use crate::core::config::CacheSettings;
    use crate::core::redis::RedisHandle;

    use super::*;

    fn offline_tracker() -> ProgressTracker {
        let settings =
            CacheSettings { l1_max_entries: 64, default_ttl_seconds: 300, warm_batch_size: 10 };
        // Never connected: every update takes the local merge path.
        let cache = TieredCache::new(&settings, RedisHandle::new("redis://127.0.0.1:1/0".into()));
        ProgressTracker::new(cache, 3600)
    }

    #[tokio::test]
    async fn absent_run_reads_as_none() {
        let tracker = offline_tracker();
        assert!(tracker.read("e1").await.is_none());
    }

    #[tokio::test]
    async fn chunks_accumulate_into_one_record() {
        let tracker = offline_tracker();

        tracker.record_chunk("e1", 3, 500, 0).await;
        tracker.record_chunk("e1", 3, 480, 20).await;
        tracker.record_chunk("e1", 3, 200, 0).await;

        let record = tracker.read("e1").await.expect("record exists");
        assert_eq!(record.exam_id, "e1");
        assert_eq!(record.total_chunks, 3);
        assert_eq!(record.completed_chunks, 3);
        assert_eq!(record.total_success, 1180);
        assert_eq!(record.total_errors, 20);
        assert!(record.start_time > 0);
        assert!(record.last_update >= record.start_time);
    }

    #[tokio::test]
    async fn concurrent_chunk_completions_lose_no_increments() {
        let tracker = offline_tracker();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.record_chunk("e1", 8, 100, 0).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = tracker.read("e1").await.expect("record exists");
        assert_eq!(record.completed_chunks, 8);
        assert_eq!(record.total_success, 800);
    }

    #[tokio::test]
    async fn runs_for_different_exams_stay_separate() {
        let tracker = offline_tracker();

        tracker.record_chunk("e1", 2, 10, 0).await;
        tracker.record_chunk("e2", 1, 5, 1).await;

        assert_eq!(tracker.read("e1").await.unwrap().total_success, 10);
        let second = tracker.read("e2").await.unwrap();
        assert_eq!(second.total_success, 5);
        assert_eq!(second.total_errors, 1);
    }

    #[test]
    fn decode_tolerates_missing_optional_fields() {
        let fields: HashMap<String, String> = [
            ("total_chunks", "3"),
            ("completed_chunks", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let record = decode_record("e1", &fields).expect("decodes");
        assert_eq!(record.exam_id, "e1");
        assert_eq!(record.completed_chunks, 1);
        assert_eq!(record.total_success, 0);
    }

    #[test]
    fn decode_rejects_records_without_counters() {
        let fields: HashMap<String, String> =
            [("exam_id".to_owned(), "e1".to_owned())].into_iter().collect();
        assert!(decode_record("e1", &fields).is_none());
    }
}
