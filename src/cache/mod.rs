mod l1;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::config::CacheSettings;
use crate::core::redis::{RedisHandle, RedisHealth};

use l1::FifoMap;

/// Read-through/write-through cache: bounded in-process tier in front of
/// Redis. Losing Redis never fails a caller; reads degrade to the local tier
/// and writes keep landing there until the connection comes back.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    l1: Mutex<FifoMap>,
    redis: RedisHandle,
    default_ttl_seconds: u64,
    warm_batch_size: usize,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1_entries: usize,
    pub l1_max_entries: usize,
    pub l1_utilization: f64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub l2_connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub healthy: bool,
    pub l1_entries: usize,
    pub l2_reachable: bool,
}

impl TieredCache {
    pub fn new(settings: &CacheSettings, redis: RedisHandle) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                l1: Mutex::new(FifoMap::new(settings.l1_max_entries)),
                redis,
                default_ttl_seconds: settings.default_ttl_seconds,
                warm_batch_size: settings.warm_batch_size.max(1),
                l1_hits: AtomicU64::new(0),
                l2_hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let local = {
            let mut l1 = self.lock_l1();
            l1.get(key)
        };
        if let Some(payload) = local {
            self.inner.l1_hits.fetch_add(1, Ordering::Relaxed);
            return parse_payload(key, &payload);
        }

        let Some(mut conn) = self.inner.redis.manager().await else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(payload)) => {
                self.inner.l2_hits.fetch_add(1, Ordering::Relaxed);
                self.store_local(key, payload.clone(), self.inner.default_ttl_seconds);
                parse_payload(key, &payload)
            }
            Ok(None) => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "cache read failed, treating as miss");
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Read-through: on miss, runs the loader and stores its result. Cache
    /// trouble never surfaces here; only the loader's own error does.
    pub async fn get_with<T, F, Fut>(
        &self,
        key: &str,
        ttl_seconds: Option<u64>,
        loader: F,
    ) -> anyhow::Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        match loader().await? {
            Some(value) => {
                self.set(key, &value, ttl_seconds).await;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: Option<u64>) {
        let ttl = ttl_seconds.unwrap_or(self.inner.default_ttl_seconds);
        let Some(payload) = serialize_payload(key, value) else { return };

        self.store_local(key, payload.clone(), ttl);

        let Some(mut conn) = self.inner.redis.manager().await else { return };
        let outcome: redis::RedisResult<()> = if ttl > 0 {
            conn.set_ex(key, payload, ttl).await
        } else {
            conn.set(key, payload).await
        };
        if let Err(err) = outcome {
            tracing::warn!(key, error = %err, "cache write skipped the shared tier");
        }
    }

    pub async fn mset<T: Serialize>(&self, pairs: &[(String, T)], ttl_seconds: Option<u64>) {
        let ttl = ttl_seconds.unwrap_or(self.inner.default_ttl_seconds);
        let serialized: Vec<(String, String)> = pairs
            .iter()
            .filter_map(|(key, value)| {
                serialize_payload(key, value).map(|payload| (key.clone(), payload))
            })
            .collect();
        self.write_batch(&serialized, ttl).await;
    }

    pub async fn mdelete(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }

        {
            let mut l1 = self.lock_l1();
            for key in keys {
                l1.remove(key);
            }
        }

        let Some(mut conn) = self.inner.redis.manager().await else { return };
        if let Err(err) = conn.del::<_, ()>(keys).await {
            tracing::warn!(count = keys.len(), error = %err, "cache delete skipped the shared tier");
        }
    }

    /// Bulk-populates both tiers in fixed-size batches so a large warm-up
    /// never turns into one giant pipeline. Returns how many items were
    /// written.
    pub async fn warm_cache<T, F>(&self, items: &[T], key_fn: F, ttl_seconds: Option<u64>) -> usize
    where
        T: Serialize,
        F: Fn(&T) -> String,
    {
        let ttl = ttl_seconds.unwrap_or(self.inner.default_ttl_seconds);
        let mut written = 0;
        for batch in items.chunks(self.inner.warm_batch_size) {
            let serialized: Vec<(String, String)> = batch
                .iter()
                .filter_map(|item| {
                    let key = key_fn(item);
                    serialize_payload(&key, item).map(|payload| (key, payload))
                })
                .collect();
            written += serialized.len();
            self.write_batch(&serialized, ttl).await;
        }
        written
    }

    /// HSETNX/HINCRBY/HSET plus EXPIRE in one pipeline. Returns false when the
    /// shared tier was unavailable, in which case the caller falls back to
    /// [`merge_local`](Self::merge_local).
    pub async fn hash_apply(
        &self,
        key: &str,
        init: &[(&str, String)],
        incr: &[(&str, i64)],
        set: &[(&str, String)],
        ttl_seconds: u64,
    ) -> bool {
        let Some(mut conn) = self.inner.redis.manager().await else { return false };

        let mut pipe = redis::pipe();
        for (field, value) in init {
            pipe.hset_nx(key, *field, value).ignore();
        }
        for (field, delta) in incr {
            pipe.hincr(key, *field, *delta).ignore();
        }
        for (field, value) in set {
            pipe.hset(key, *field, value).ignore();
        }
        if ttl_seconds > 0 {
            pipe.expire(key, ttl_seconds as i64).ignore();
        }

        match pipe.query_async::<_, ()>(&mut conn).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache hash update skipped the shared tier");
                false
            }
        }
    }

    pub async fn hash_get_all(&self, key: &str) -> Option<HashMap<String, String>> {
        let mut conn = self.inner.redis.manager().await?;
        match conn.hgetall::<_, HashMap<String, String>>(key).await {
            Ok(map) if !map.is_empty() => Some(map),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache hash read failed, treating as miss");
                None
            }
        }
    }

    /// Atomic read-modify-write against the in-process tier only. Used while
    /// the shared tier is down; the single lock acquisition makes concurrent
    /// merges within this process safe.
    pub fn merge_local<T, F>(&self, key: &str, ttl_seconds: u64, merge: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let mut l1 = self.lock_l1();
        let current = l1.get(key).and_then(|payload| parse_payload(key, &payload));
        let merged = merge(current);
        if let Some(payload) = serialize_payload(key, &merged) {
            l1.insert(key, payload, ttl_seconds);
        }
        merged
    }

    pub(crate) fn local_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let payload = self.lock_l1().get(key)?;
        parse_payload(key, &payload)
    }

    pub async fn stats(&self) -> CacheStats {
        let (l1_entries, l1_max_entries) = {
            let l1 = self.lock_l1();
            (l1.len(), l1.capacity())
        };
        CacheStats {
            l1_entries,
            l1_max_entries,
            l1_utilization: l1_entries as f64 / l1_max_entries as f64,
            l1_hits: self.inner.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.inner.l2_hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            l2_connected: self.inner.redis.manager().await.is_some(),
        }
    }

    /// `healthy` mirrors the shared tier's reachability; the local tier keeps
    /// serving either way.
    pub async fn health_check(&self) -> CacheHealth {
        let l2_reachable = matches!(self.inner.redis.health().await, RedisHealth::Healthy);
        CacheHealth { healthy: l2_reachable, l1_entries: self.lock_l1().len(), l2_reachable }
    }

    async fn write_batch(&self, pairs: &[(String, String)], ttl: u64) {
        if pairs.is_empty() {
            return;
        }

        {
            let mut l1 = self.lock_l1();
            for (key, payload) in pairs {
                if let Some(evicted) = l1.insert(key, payload.clone(), ttl) {
                    metrics::counter!("cache_l1_evictions_total").increment(1);
                    tracing::debug!(key = %evicted, "local cache tier evicted earliest entry");
                }
            }
        }

        let Some(mut conn) = self.inner.redis.manager().await else { return };
        let mut pipe = redis::pipe();
        for (key, payload) in pairs {
            if ttl > 0 {
                pipe.set_ex(key, payload, ttl).ignore();
            } else {
                pipe.set(key, payload).ignore();
            }
        }
        if let Err(err) = pipe.query_async::<_, ()>(&mut conn).await {
            tracing::warn!(count = pairs.len(), error = %err, "cache batch write skipped the shared tier");
        }
    }

    fn store_local(&self, key: &str, payload: String, ttl: u64) {
        let mut l1 = self.lock_l1();
        if let Some(evicted) = l1.insert(key, payload, ttl) {
            metrics::counter!("cache_l1_evictions_total").increment(1);
            tracing::debug!(key = %evicted, "local cache tier evicted earliest entry");
        }
    }

    fn lock_l1(&self) -> MutexGuard<'_, FifoMap> {
        self.inner.l1.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_payload<T: DeserializeOwned>(key: &str, payload: &str) -> Option<T> {
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, error = %err, "cache entry failed to deserialize, dropping it");
            None
        }
    }
}

fn serialize_payload<T: Serialize>(key: &str, value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(payload) => Some(payload),
        Err(err) => {
            tracing::error!(key, error = %err, "cache value failed to serialize, skipping write");
            None
        }
    }
}
