//! Weak-referencing LRU object cache
//!
//! # Architecture
//!
//! ```text
//! WeakLruCache
//!   ├─→ strong: LruCache<K, Arc<V>>   (capacity N, holds objects alive)
//!   └─→ weak:   HashMap<K, Weak<V>>   (entries pushed out of the LRU)
//! ```
//!
//! An entry evicted from the strong LRU is demoted to a weak reference. It
//! stays retrievable for as long as some other owner keeps the `Arc`
//! alive; a hit on a weak entry promotes it back into the LRU. Capacity 0
//! disables the cache entirely.

use lru::LruCache;
use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

pub struct WeakLruCache<K, V> {
    strong: Option<LruCache<K, Arc<V>>>,
    weak: HashMap<K, Weak<V>>,
    capacity: usize,
    hits: u64,
    weak_hits: u64,
    misses: u64,
}

impl<K: Hash + Eq + Clone, V> WeakLruCache<K, V> {
    /// Create a cache holding at most `capacity` strong entries
    pub fn new(capacity: usize) -> Self {
        Self {
            strong: NonZeroUsize::new(capacity).map(LruCache::new),
            weak: HashMap::new(),
            capacity,
            hits: 0,
            weak_hits: 0,
            misses: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.strong.is_some()
    }

    /// Look up an entry, refreshing its recency and counting the access
    pub fn get(&mut self, key: &K) -> Option<Arc<V>> {
        let strong = self.strong.as_mut()?;
        if let Some(value) = strong.get(key) {
            self.hits += 1;
            return Some(Arc::clone(value));
        }

        match self.weak.remove(key).and_then(|w| w.upgrade()) {
            Some(value) => {
                self.hits += 1;
                self.weak_hits += 1;
                self.insert(key.clone(), Arc::clone(&value));
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up an entry without touching recency or statistics
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let strong = self.strong.as_ref()?;
        strong
            .peek(key)
            .cloned()
            .or_else(|| self.weak.get(key).and_then(Weak::upgrade))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Insert an entry, demoting the least recently used one if full
    pub fn insert(&mut self, key: K, value: Arc<V>) {
        let Some(strong) = self.strong.as_mut() else {
            return;
        };
        self.weak.remove(&key);

        if let Some((evicted, old)) = strong.push(key.clone(), value) {
            if evicted != key {
                self.weak.insert(evicted, Arc::downgrade(&old));
            }
        }

        if self.weak.len() > self.capacity {
            self.purge();
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<Arc<V>> {
        let weak = self.weak.remove(key).and_then(|w| w.upgrade());
        self.strong.as_mut().and_then(|s| s.pop(key)).or(weak)
    }

    /// Drop every entry, strong and weak
    pub fn clear(&mut self) {
        if let Some(strong) = self.strong.as_mut() {
            strong.clear();
        }
        self.weak.clear();
    }

    /// Forget weak entries whose objects are gone
    pub fn purge(&mut self) {
        self.weak.retain(|_, w| w.strong_count() > 0);
    }

    /// Number of strong entries
    pub fn len(&self) -> usize {
        self.strong.as_ref().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats::new(
            self.hits,
            self.misses,
            self.len(),
            self.capacity,
        )
        .with_weak(self.weak_hits, self.weak.len())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
    /// Hits served by a demoted entry
    pub weak_hits: u64,
    /// Demoted entries currently tracked
    pub weak_size: usize,
}

impl CacheStats {
    pub(crate) fn new(hits: u64, misses: u64, size: usize, capacity: usize) -> Self {
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };
        Self {
            hits,
            misses,
            hit_rate,
            size,
            capacity,
            ..Self::default()
        }
    }

    fn with_weak(mut self, weak_hits: u64, weak_size: usize) -> Self {
        self.weak_hits = weak_hits;
        self.weak_size = weak_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_basic() {
        let mut cache: WeakLruCache<u64, String> = WeakLruCache::new(10);

        // Initially empty
        assert!(cache.get(&1).is_none());

        cache.insert(1, Arc::new("one".to_string()));
        assert_eq!(cache.get(&1).as_deref().map(String::as_str), Some("one"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_evicted_entries_survive_while_held() {
        let mut cache: WeakLruCache<u64, u64> = WeakLruCache::new(2);
        let held = Arc::new(1);
        cache.insert(1, Arc::clone(&held));
        cache.insert(2, Arc::new(2));
        cache.insert(3, Arc::new(3));
        cache.insert(4, Arc::new(4));

        // 1 was demoted but is still held by us, 2 was demoted and dropped
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&2).is_none());
        let value = cache.get(&1);
        assert!(value.is_some_and(|v| Arc::ptr_eq(&v, &held)));
        assert_eq!(cache.stats().weak_hits, 1);

        // The promoted entry is strong again
        drop(held);
        assert!(cache.get(&1).is_some());
    }

    #[test]
    fn test_peek_does_not_count() {
        let mut cache: WeakLruCache<u64, u64> = WeakLruCache::new(4);
        cache.insert(7, Arc::new(7));
        assert!(cache.peek(&7).is_some());
        assert!(cache.peek(&8).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 0);
    }

    #[test]
    fn test_zero_capacity_disables() {
        let mut cache: WeakLruCache<u64, u64> = WeakLruCache::new(0);
        let value = Arc::new(5);
        cache.insert(5, Arc::clone(&value));
        assert!(!cache.is_enabled());
        assert!(cache.get(&5).is_none());
        assert!(cache.peek(&5).is_none());
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_cache_remove_and_clear() {
        let mut cache: WeakLruCache<u64, u64> = WeakLruCache::new(1);
        let held = Arc::new(1);
        cache.insert(1, Arc::clone(&held));
        cache.insert(2, Arc::new(2));

        assert!(cache.remove(&1).is_some());
        assert!(cache.peek(&1).is_none());

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.peek(&2).is_none());
    }
}
