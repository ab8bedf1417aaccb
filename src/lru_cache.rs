//! Fixed-capacity LRU cache with hit/miss/eviction accounting
//!
//! Thin statistics layer over `lru::LruCache`: the inner cache sits behind a
//! mutex, while the counters are atomics so stats reads never contend with
//! lookups. Every cache in the crate (LCA, path queries, adapter caches) is
//! one of these.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

/// Capacity used when a caller asks for zero or a negative-equivalent size.
pub const DEFAULT_CAPACITY: usize = 100;

/// An LRU cache that counts hits, misses, and evictions.
pub struct StatsCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> StatsCache<K, V> {
    /// Create a cache holding at most `capacity` entries. A capacity of zero
    /// falls back to [`DEFAULT_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or update `key`. Inserting into a full cache evicts the
    /// least-recently-used entry and increments the eviction counter.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let at_capacity = inner.len() == inner.cap().get();
        let updated = inner.put(key, value).is_some();
        if at_capacity && !updated {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove `key` if present.
    pub fn delete(&self, key: &K) -> bool {
        self.inner.lock().pop(key).is_some()
    }

    /// Drop every entry. Counters are preserved; eviction counts only track
    /// capacity pressure, not explicit invalidation.
    pub fn purge(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    /// (hits, misses) counters, readable without taking the cache lock.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_falls_back_to_default() {
        let cache: StatsCache<String, i64> = StatsCache::new(0);
        assert_eq!(cache.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn get_counts_hits_and_misses() {
        let cache: StatsCache<&str, i64> = StatsCache::new(4);
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn exactly_one_eviction_past_capacity() {
        let cache: StatsCache<u32, u32> = StatsCache::new(3);
        for i in 0..4 {
            cache.set(i, i);
        }
        assert_eq!(cache.evictions(), 1);
        assert_eq!(cache.len(), 3);
        // 0 was the least recently used.
        assert_eq!(cache.get(&0), None);
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn get_promotes_to_most_recently_used() {
        let cache: StatsCache<u32, u32> = StatsCache::new(2);
        cache.set(1, 1);
        cache.set(2, 2);
        assert_eq!(cache.get(&1), Some(1));
        cache.set(3, 3);
        // 2 was evicted, not the freshly-touched 1.
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(1));
    }

    #[test]
    fn update_at_capacity_does_not_evict() {
        let cache: StatsCache<u32, u32> = StatsCache::new(2);
        cache.set(1, 1);
        cache.set(2, 2);
        cache.set(2, 20);
        assert_eq!(cache.evictions(), 0);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&1), Some(1));
    }

    #[test]
    fn delete_and_purge() {
        let cache: StatsCache<&str, i64> = StatsCache::new(4);
        cache.set("a", 1);
        cache.set("b", 2);
        assert!(cache.delete(&"a"));
        assert!(!cache.delete(&"a"));
        cache.purge();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.evictions(), 0);
    }
}
