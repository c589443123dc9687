//! Byte- and age-bounded LRU cache of successful render results

use crate::{format_bytes, metrics, CacheConfig, RenderResult};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

struct CacheEntry {
    result: RenderResult,
    size: usize,
    inserted_at: Instant,
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.total_bytes -= entry.size;
        Some(entry)
    }
}

/// Render results keyed by the exact request URL
///
/// The summed body length of all entries stays within `max_size`, except
/// that a single entry larger than the whole budget is still stored once
/// everything else has been evicted. Entries older than `max_age` read as
/// misses and are dropped on the spot.
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    max_age: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

impl ResultCache {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                hits: 0,
                misses: 0,
            }),
            max_size,
            max_age,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, config.max_age)
    }

    pub fn get(&self, key: &str) -> Option<RenderResult> {
        let mut inner = self.inner.lock();

        let expired = inner
            .entries
            .peek(key)
            .map(|entry| entry.inserted_at.elapsed() > self.max_age);

        if expired.is_none() {
            inner.misses += 1;
            drop(inner);
            debug!("cache miss for '{}'", key);
            metrics::record_cache_lookup(false);
            return None;
        }

        if expired == Some(true) {
            inner.remove(key);
            inner.misses += 1;
            drop(inner);
            debug!("cache entry for '{}' expired", key);
            metrics::record_cache_lookup(false);
            return None;
        }

        inner.hits += 1;
        let result = inner.entries.get(key).map(|entry| entry.result.clone());
        drop(inner);
        debug!("cache hit for '{}'", key);
        metrics::record_cache_lookup(true);
        result
    }

    pub fn set(&self, key: impl Into<String>, result: RenderResult) {
        let key = key.into();
        let size = result.body.len();
        let mut inner = self.inner.lock();

        inner.remove(&key);
        inner.entries.push(
            key.clone(),
            CacheEntry {
                result,
                size,
                inserted_at: Instant::now(),
            },
        );
        inner.total_bytes += size;

        let mut evicted = 0;
        while inner.total_bytes > self.max_size && inner.entries.len() > 1 {
            match inner.entries.pop_lru() {
                Some((_, entry)) => {
                    inner.total_bytes -= entry.size;
                    evicted += 1;
                }
                None => break,
            }
        }

        metrics::record_cache_size(inner.entries.len(), inner.total_bytes);
        drop(inner);

        debug!("'{}' has been cached ({})", key, format_bytes(size));
        if evicted > 0 {
            debug!("Evicted {} least recently used cache entries", evicted);
        }
    }

    /// Drops every expired entry.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() > self.max_age)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        metrics::record_cache_size(inner.entries.len(), inner.total_bytes);
        drop(inner);

        debug!("Cache pruned, {} expired entries removed", expired.len());
        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
        metrics::record_cache_size(0, 0);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            max_bytes: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            "Cache has {} items, a total of {} ({:.1}% hit rate)",
            stats.entries,
            format_bytes(stats.total_bytes),
            stats.hit_rate() * 100.0
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(body: &str) -> RenderResult {
        RenderResult::new(200, body)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = ResultCache::new(1024, Duration::from_secs(60));
        cache.set("https://example.com", result("body"));

        assert_eq!(cache.get("https://example.com"), Some(result("body")));
        assert_eq!(cache.get("https://example.com/other"), None);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 4);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_size() {
        let cache = ResultCache::new(1024, Duration::from_secs(60));
        cache.set("k", result("0123456789"));
        cache.set("k", result("abc"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().total_bytes, 3);
        assert_eq!(cache.get("k"), Some(result("abc")));
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        cache.set("a", result("aaaa"));
        cache.set("b", result("bbbb"));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.set("c", result("cccc"));

        assert_eq!(cache.get("b"), None);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().total_bytes, 8);
    }

    #[tokio::test]
    async fn test_total_never_exceeds_max() {
        let cache = ResultCache::new(100, Duration::from_secs(60));
        for i in 0..50 {
            cache.set(format!("key-{i}"), result(&"x".repeat(7 + i % 5)));
            assert!(cache.stats().total_bytes <= 100);
        }
    }

    #[tokio::test]
    async fn test_oversized_entry_evicts_everything_else() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        cache.set("a", result("aaaa"));
        cache.set("b", result("bbbb"));
        cache.set("huge", result(&"h".repeat(25)));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().total_bytes, 25);
        assert!(cache.get("huge").is_some());
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test]
    async fn test_multibyte_bodies_count_bytes() {
        let cache = ResultCache::new(1024, Duration::from_secs(60));
        cache.set("k", result("héllo"));
        assert_eq!(cache.stats().total_bytes, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cache = ResultCache::new(1024, Duration::from_secs(30));
        cache.set("k", result("body"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().total_bytes, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_removes_only_expired() {
        let cache = ResultCache::new(1024, Duration::from_secs(30));
        cache.set("old", result("old"));
        tokio::time::advance(Duration::from_secs(20)).await;
        cache.set("new", result("new"));
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().total_bytes, 3);
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            entries: 0,
            total_bytes: 0,
            max_bytes: 10,
            hits: 3,
            misses: 1,
        };
        assert_eq!(stats.hit_rate(), 0.75);
    }
}
