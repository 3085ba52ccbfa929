// Final-result cache.
//
// LRU-evicted, TTL-bounded map from (dataset id, normalized query, schema
// fingerprint) to a previously computed FinalResult. Shared across all
// concurrent runs; every operation is safe under concurrent invocation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::pipeline::types::FinalResult;

/// Cache key. Query text must already be normalized (see
/// [`normalize_query`]) so hits are deterministic across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub dataset_id: String,
    pub normalized_query: String,
    pub schema_fingerprint: String,
}

impl CacheKey {
    pub fn new(dataset_id: &str, query: &str, schema_fingerprint: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            normalized_query: normalize_query(query),
            schema_fingerprint: schema_fingerprint.to_string(),
        }
    }
}

/// Case and whitespace folding. Stable: the same input always yields the
/// same normalized form.
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
struct CachedEntry {
    result: FinalResult,
    cached_at: Instant,
    last_accessed: Instant,
    hit_count: u64,
}

impl CachedEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    entries: HashMap<CacheKey, CachedEntry>,
    stats: CacheStats,
}

/// Result cache with LRU eviction and TTL expiry.
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            capacity,
            ttl,
        }
    }

    /// Get a cached result. An expired entry behaves as a miss and is
    /// removed; a live hit refreshes its recency.
    pub fn get(&self, key: &CacheKey) -> Option<FinalResult> {
        let mut inner = self.inner.lock().unwrap();

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired(self.ttl),
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };

        if expired {
            inner.entries.remove(key);
            inner.stats.misses += 1;
            inner.stats.expirations += 1;
            tracing::debug!("Cache entry expired for dataset {}", key.dataset_id);
            return None;
        }

        inner.stats.hits += 1;
        let entry = inner.entries.get_mut(key).unwrap();
        entry.last_accessed = Instant::now();
        entry.hit_count += 1;
        tracing::debug!(
            "Cache hit for dataset {} (hit_count: {})",
            key.dataset_id,
            entry.hit_count
        );
        Some(entry.result.clone())
    }

    /// Store a result. Overwriting a live entry for the same key is
    /// permitted: concurrent runs for one key are expected to produce
    /// equivalent results, so the last successful writer wins.
    pub fn put(&self, key: CacheKey, result: FinalResult) {
        let mut inner = self.inner.lock().unwrap();

        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(&key) {
            Self::evict_lru(&mut inner);
        }

        let now = Instant::now();
        inner.entries.insert(
            key,
            CachedEntry {
                result,
                cached_at: now,
                last_accessed: now,
                hit_count: 0,
            },
        );
        tracing::debug!("Cached result (cache size: {})", inner.entries.len());
    }

    fn evict_lru(inner: &mut CacheInner) {
        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            inner.entries.remove(&key);
            inner.stats.evictions += 1;
            tracing::debug!("Evicted least recently used cache entry");
        }
    }

    /// Remove all expired entries. Safe to call from a background sweep.
    pub fn cleanup_expired(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ttl = self.ttl;
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(ttl))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.entries.remove(key);
            inner.stats.expirations += 1;
        }
        if !expired.is_empty() {
            tracing::info!("Cleaned up {} expired cache entries", expired.len());
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.entries.len();
        inner.entries.clear();
        tracing::info!("Cleared {} cache entries", count);
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats.clone()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}
