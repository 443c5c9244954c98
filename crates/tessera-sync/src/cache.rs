//! Short-TTL response cache keyed by stream key.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A cached fetch result.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(value: Value, fetched_at: Instant, ttl: Duration) -> Self {
        Self {
            value,
            fetched_at,
            ttl,
        }
    }

    /// An entry is fresh strictly before `fetched_at + ttl`.
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

/// Map of stream key to its last fetched value.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value if it is still fresh. Stale entries read as absent.
    pub fn get_fresh(&self, key: &str, now: Instant) -> Option<Value> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh_at(now))
            .map(|entry| entry.value.clone())
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn evict(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_freshness_boundary() {
        let start = Instant::now();
        let entry = CacheEntry::new(json!(1), start, Duration::from_millis(500));

        assert!(entry.is_fresh_at(start));
        assert!(entry.is_fresh_at(start + Duration::from_millis(499)));
        assert!(!entry.is_fresh_at(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_stale_reads_as_absent() {
        let start = Instant::now();
        let mut cache = ResponseCache::new();
        cache.insert(
            "tree",
            CacheEntry::new(json!({ "v": 1 }), start, Duration::from_millis(100)),
        );

        assert_eq!(cache.get_fresh("tree", start), Some(json!({ "v": 1 })));
        assert_eq!(cache.get_fresh("tree", start + Duration::from_secs(1)), None);
        // The stale entry is still held until evicted.
        assert!(cache.get("tree").is_some());

        cache.evict("tree");
        assert!(cache.is_empty());
    }
}
