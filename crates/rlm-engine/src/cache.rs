// crates/rlm-engine/src/cache.rs
// Content-addressed TTL + LRU cache for worker results

use crate::config::CacheConfig;
use crate::worker::WorkerResult;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Only this much of the context participates in the hash
pub const HASH_CONTEXT_PREFIX_CHARS: usize = 1_000;

/// A worker result plus the bookkeeping needed for expiry
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub result: WorkerResult,
    pub cached_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Process-wide result cache. Construct once and share via `Arc`.
///
/// A poisoned lock is treated as a miss; the cache never blocks an execution.
pub struct ResultCache {
    entries: Mutex<LruCache<String, CachedResult>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_capacity(capacity: usize, ttl: Duration) -> Self {
        Self::new(&CacheConfig { capacity, ttl })
    }

    /// SHA-256 over the query and a bounded prefix of the context
    pub fn generate_hash(query: &str, context_slice: &str) -> String {
        let prefix_end = context_slice
            .char_indices()
            .nth(HASH_CONTEXT_PREFIX_CHARS)
            .map(|(i, _)| i)
            .unwrap_or(context_slice.len());

        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(&context_slice.as_bytes()[..prefix_end]);
        format!("{:x}", hasher.finalize())
    }

    /// Look up a result, refreshing its recency. Expired entries are evicted.
    pub fn get(&self, hash: &str) -> Option<WorkerResult> {
        let Ok(mut entries) = self.entries.lock() else {
            warn!("Result cache lock poisoned, treating as miss");
            return None;
        };

        let expired = match entries.peek(hash) {
            Some(entry) => entry.cached_at.elapsed() >= self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            entries.pop(hash);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(hash = %short(hash), "Cache entry expired");
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        entries.get(hash).map(|entry| {
            let mut result = entry.result.clone();
            result.from_cache = true;
            result
        })
    }

    /// Insert or replace. At capacity the least-recently-used entry goes first.
    pub fn set(&self, hash: &str, result: WorkerResult) {
        let Ok(mut entries) = self.entries.lock() else {
            warn!("Result cache lock poisoned, skipping write");
            return;
        };

        let entry = CachedResult {
            result,
            cached_at: Instant::now(),
        };

        if let Some((evicted, _)) = entries.push(hash.to_string(), entry) {
            if evicted != hash {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %short(&evicted), "Evicted least-recently-used cache entry");
            }
        }
    }

    /// TTL-aware existence check; does not touch recency
    pub fn has(&self, hash: &str) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        entries
            .peek(hash)
            .is_some_and(|entry| entry.cached_at.elapsed() < self.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(answer: &str, confidence: f64) -> WorkerResult {
        WorkerResult {
            answer: answer.to_string(),
            confidence,
            sub_query: format!("q-{answer}"),
            tokens_used: 42,
            from_cache: false,
        }
    }

    // ============================================================================
    // Hashing
    // ============================================================================

    #[test]
    fn test_hash_is_deterministic() {
        let a = ResultCache::generate_hash("query", "context");
        let b = ResultCache::generate_hash("query", "context");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_separates_query_and_context() {
        assert_ne!(
            ResultCache::generate_hash("ab", "c"),
            ResultCache::generate_hash("a", "bc")
        );
    }

    #[test]
    fn test_hash_ignores_context_past_prefix() {
        let base = "x".repeat(HASH_CONTEXT_PREFIX_CHARS);
        let a = ResultCache::generate_hash("q", &format!("{base}tail one"));
        let b = ResultCache::generate_hash("q", &format!("{base}tail two"));
        assert_eq!(a, b);

        let c = ResultCache::generate_hash("q", &format!("y{base}"));
        assert_ne!(a, c);
    }

    // ============================================================================
    // Round trip and TTL
    // ============================================================================

    #[test]
    fn test_round_trip_marks_from_cache() {
        let cache = ResultCache::default();
        let original = result("Paris", 0.9);
        cache.set("h1", original.clone());

        let hit = cache.get("h1").unwrap();
        assert!(hit.from_cache);
        assert_eq!(
            hit,
            WorkerResult {
                from_cache: true,
                ..original
            }
        );
        assert_eq!(hit.tokens_used, 42);
    }

    #[test]
    fn test_missing_entry() {
        let cache = ResultCache::default();
        assert!(cache.get("nope").is_none());
        assert!(!cache.has("nope"));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_expired_entries_are_absent_and_evicted() {
        let cache = ResultCache::with_capacity(10, Duration::from_millis(5));
        cache.set("h", result("stale", 0.8));
        std::thread::sleep(Duration::from_millis(20));

        assert!(!cache.has("h"));
        assert_eq!(cache.len(), 1, "has() must not mutate");
        assert!(cache.get("h").is_none());
        assert_eq!(cache.len(), 0, "get() evicts lazily");
    }

    #[test]
    fn test_set_replaces_existing() {
        let cache = ResultCache::default();
        cache.set("h", result("old", 0.5));
        cache.set("h", result("new", 0.6));
        assert_eq!(cache.get("h").unwrap().answer, "new");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    // ============================================================================
    // LRU eviction
    // ============================================================================

    #[test]
    fn test_eviction_follows_touch_not_insertion() {
        let cache = ResultCache::with_capacity(3, Duration::from_secs(60));
        cache.set("a", result("a", 0.5));
        cache.set("b", result("b", 0.5));
        cache.set("c", result("c", 0.5));

        // Touch "a" so "b" becomes least recently used
        assert!(cache.get("a").is_some());
        cache.set("d", result("d", 0.5));

        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_has_does_not_refresh_recency() {
        let cache = ResultCache::with_capacity(2, Duration::from_secs(60));
        cache.set("a", result("a", 0.5));
        cache.set("b", result("b", 0.5));
        assert!(cache.has("a"));
        cache.set("c", result("c", 0.5));
        assert!(!cache.has("a"));
    }

    #[test]
    fn test_clear_and_stats() {
        let cache = ResultCache::default();
        cache.set("a", result("a", 0.5));
        let _ = cache.get("a");
        let _ = cache.get("zzz");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
