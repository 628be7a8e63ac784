// Result Cache Service
//
// TTL-bounded, capacity-bounded cache with LRU eviction. Backs both the
// engine's query result cache and the LLM response cache.
//
// All state sits behind one mutex so insert, lookup and eviction are
// serialized per cache instance. Check-then-compute around the cache is not
// atomic: two identical concurrent misses both compute and the last write wins.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cached value with metadata
#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    cached_at: Instant,
    ttl: Duration,
    hit_count: u64,
    /// Access sequence number, larger is more recent
    last_access: u64,
}

impl<V> CachedEntry<V> {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CachedEntry<V>>,
    clock: u64,
    stats: CacheStats,
}

impl<V> CacheState<V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Total expirations
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Result cache with LRU eviction and TTL
pub struct ResultCache<V> {
    state: Mutex<CacheState<V>>,
    max_size: usize,
    default_ttl: Duration,
}

impl<V: Clone> ResultCache<V> {
    /// Create a new cache
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum number of cached entries
    /// * `default_ttl_secs` - Default TTL in seconds
    pub fn new(max_size: usize, default_ttl_secs: u64) -> Self {
        Self::with_ttl(max_size, Duration::from_secs(default_ttl_secs))
    }

    pub fn with_ttl(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
                stats: CacheStats::default(),
            }),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    /// SHA-256 over the parts joined with `:`
    pub fn generate_key(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(parts.join(":").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get cached value if available and not expired
    pub fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let seq = state.tick();

        let expired = match state.entries.get_mut(key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => {
                entry.hit_count += 1;
                entry.last_access = seq;
                let value = entry.value.clone();
                let hit_count = entry.hit_count;
                state.stats.hits += 1;
                tracing::debug!("Cache hit for key: {} (hit_count: {})", key, hit_count);
                return Some(value);
            }
            None => false,
        };

        if expired {
            state.entries.remove(key);
            state.stats.expirations += 1;
            tracing::debug!("Cache expired for key: {}", key);
        }
        state.stats.misses += 1;
        None
    }

    /// Store a value, evicting the least recently used entry when full
    pub fn put(&self, key: String, value: V, ttl: Option<Duration>) {
        let mut state = self.lock();
        let seq = state.tick();

        if state.entries.len() >= self.max_size && !state.entries.contains_key(&key) {
            Self::evict_lru(&mut state);
        }

        state.entries.insert(
            key.clone(),
            CachedEntry {
                value,
                cached_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                hit_count: 0,
                last_access: seq,
            },
        );

        tracing::debug!("Cached value for key: {} (cache size: {})", key, state.entries.len());
    }

    fn evict_lru(state: &mut CacheState<V>) {
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            state.entries.remove(&key);
            state.stats.evictions += 1;
            tracing::debug!("Evicted cache entry: {}", key);
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.lock().entries.remove(key).map(|entry| entry.value)
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        let mut state = self.lock();
        let count = state.entries.len();
        state.entries.clear();
        tracing::info!("Cleared {} cache entries", count);
    }

    pub fn get_stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Remove expired entries, returns how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired());
        let removed = before - state.entries.len();
        state.stats.expirations += removed as u64;

        if removed > 0 {
            tracing::info!("Cleaned up {} expired cache entries", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!([{"id": 1, "name": "Alice"}, {"id": 2, "name": "Bob"}])
    }

    #[test]
    fn test_cache_key_generation() {
        let key1 = ResultCache::<u8>::generate_key(&["count users", "{}"]);
        let key2 = ResultCache::<u8>::generate_key(&["count users", "{}"]);
        let key3 = ResultCache::<u8>::generate_key(&["count users", "{\"a\":1}"]);

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1.len(), 64);
    }

    #[test]
    fn test_cache_put_and_get() {
        let cache = ResultCache::new(10, 60);
        cache.put("k".to_string(), sample(), None);

        let cached = cache.get("k");
        assert_eq!(cached, Some(sample()));
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_cache_expiration() {
        let cache = ResultCache::new(10, 1);
        cache.put("k".to_string(), sample(), Some(Duration::from_millis(50)));

        assert!(cache.get("k").is_some());
        std::thread::sleep(Duration::from_millis(100));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.size(), 0);

        let stats = cache.get_stats();
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_cache_stats() {
        let cache = ResultCache::new(10, 60);
        cache.put("k".to_string(), sample(), None);

        cache.get("k");
        cache.get("k");
        cache.get("nonexistent");

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!(stats.hit_ratio() > 0.6);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResultCache::new(3, 60);
        cache.put("key1".to_string(), 1, None);
        cache.put("key2".to_string(), 2, None);
        cache.put("key3".to_string(), 3, None);

        // touch key1 so key2 becomes the eviction candidate
        assert_eq!(cache.get("key1"), Some(1));
        cache.put("key4".to_string(), 4, None);

        assert_eq!(cache.size(), 3);
        assert!(cache.get("key2").is_none());
        assert!(cache.get("key1").is_some());
        assert!(cache.get("key4").is_some());
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = ResultCache::new(10, 60);
        cache.put("short".to_string(), 1, Some(Duration::from_millis(10)));
        cache.put("long".to_string(), 2, None);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.size(), 1);
    }
}
