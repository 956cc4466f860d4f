use std::collections::{HashMap, VecDeque};

use tokio::time::{Duration, Instant};

struct Slot {
    payload: String,
    expires_at: Option<Instant>,
}

/// Bounded in-process tier. Eviction is strictly insertion-ordered: when a new
/// key arrives at capacity, the earliest-inserted live entry goes, regardless
/// of how recently it was read. Overwriting an existing key keeps its original
/// position in the eviction order.
pub(crate) struct FifoMap {
    capacity: usize,
    entries: HashMap<String, Slot>,
    order: VecDeque<String>,
}

impl FifoMap {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::with_capacity(capacity.max(1)),
            order: VecDeque::new(),
        }
    }

    /// Returns the stored payload if present and unexpired. Expired entries
    /// are dropped on the way out.
    pub(crate) fn get(&mut self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(slot) => slot.expires_at.is_some_and(|at| Instant::now() >= at),
            None => return None,
        };

        if expired {
            self.entries.remove(key);
            return None;
        }

        self.entries.get(key).map(|slot| slot.payload.clone())
    }

    /// Inserts or overwrites. `ttl_seconds == 0` means the entry never
    /// expires. Returns the key evicted to make room, if any.
    pub(crate) fn insert(&mut self, key: &str, payload: String, ttl_seconds: u64) -> Option<String> {
        let expires_at =
            (ttl_seconds > 0).then(|| Instant::now() + Duration::from_secs(ttl_seconds));

        if let Some(slot) = self.entries.get_mut(key) {
            slot.payload = payload;
            slot.expires_at = expires_at;
            return None;
        }

        let mut evicted = None;
        while self.entries.len() >= self.capacity {
            // The order queue can hold keys already removed or expired away;
            // skip those until a live entry is actually dropped.
            match self.order.pop_front() {
                Some(oldest) => {
                    if self.entries.remove(&oldest).is_some() {
                        evicted = Some(oldest);
                    }
                }
                None => break,
            }
        }

        self.entries.insert(key.to_owned(), Slot { payload, expires_at });
        self.order.push_back(key.to_owned());
        evicted
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_at_capacity_evicts_exactly_the_earliest_key() {
        let mut map = FifoMap::new(3);
        map.insert("a", "1".into(), 0);
        map.insert("b", "2".into(), 0);
        map.insert("c", "3".into(), 0);

        let evicted = map.insert("d", "4".into(), 0);

        assert_eq!(evicted.as_deref(), Some("a"));
        assert_eq!(map.len(), 3);
        assert!(map.get("a").is_none());
        assert_eq!(map.get("b").as_deref(), Some("2"));
        assert_eq!(map.get("d").as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn overwrite_keeps_original_eviction_position() {
        let mut map = FifoMap::new(2);
        map.insert("a", "1".into(), 0);
        map.insert("b", "2".into(), 0);
        // Refreshing "a" must not move it behind "b" in the eviction order.
        map.insert("a", "1x".into(), 0);

        let evicted = map.insert("c", "3".into(), 0);

        assert_eq!(evicted.as_deref(), Some("a"));
        assert_eq!(map.get("b").as_deref(), Some("2"));
        assert_eq!(map.get("c").as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn eviction_skips_keys_already_removed() {
        let mut map = FifoMap::new(2);
        map.insert("a", "1".into(), 0);
        map.insert("b", "2".into(), 0);
        assert!(map.remove("a"));

        map.insert("c", "3".into(), 0);
        // "a" left a stale order entry; inserting at capacity again must
        // drop "b", the earliest live key.
        let evicted = map.insert("d", "4".into(), 0);

        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(map.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_its_ttl() {
        let mut map = FifoMap::new(4);
        map.insert("k", "v".into(), 30);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(map.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(map.get("k").is_none());
        assert_eq!(map.len(), 0, "stale entry must be removed on read");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_never_expires() {
        let mut map = FifoMap::new(4);
        map.insert("k", "v".into(), 0);

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(map.get("k").as_deref(), Some("v"));
    }
}
