//! Bounded, time-bounded LRU cache with hit/miss counters.
//!
//! All mutating operations serialize through a single `tokio::sync::Mutex`
//! guarding both the map and the recency order, so only one mutation ever
//! executes at a time; this falls directly out of holding the mutex for
//! the whole operation rather than splitting reads and writes across two
//! data structures.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

struct Slot<V> {
    value: V,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

struct Inner<K, V> {
    map: HashMap<K, Slot<V>>,
    /// Recency order, oldest first. A key appears at most once.
    order: Vec<K>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// A fixed-capacity cache where entries also expire after a per-entry TTL.
pub struct LruTtlCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

/// Point-in-time hit/miss/eviction snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    /// `hitRate = hits / (hits + misses)`; `0.0` when nothing has been looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl<K, V> LruTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: Vec::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Returns the cached value, or `None` on a miss or expired entry.
    /// Touches recency order on a hit.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let expired = matches!(inner.map.get(key), Some(slot) if now >= slot.expires_at);
        if expired {
            inner.map.remove(key);
            inner.order.retain(|k| k != key);
            inner.misses += 1;
            return None;
        }

        if let Some(slot) = inner.map.get_mut(key) {
            slot.last_accessed = now;
            let value = slot.value.clone();
            inner.order.retain(|k| k != key);
            inner.order.push(key.clone());
            inner.hits += 1;
            Some(value)
        } else {
            inner.misses += 1;
            None
        }
    }

    /// Inserts or overwrites `key`, evicting the least-recently-used entry
    /// if this insert would exceed capacity.
    pub async fn set(&self, key: K, value: V, ttl: chrono::Duration) {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        if inner.map.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        } else if inner.map.len() >= self.capacity {
            if let Some(oldest) = inner.order.first().cloned() {
                inner.order.remove(0);
                inner.map.remove(&oldest);
                inner.evictions += 1;
            }
        }

        inner.map.insert(
            key.clone(),
            Slot {
                value,
                created_at: now,
                last_accessed: now,
                expires_at: now + ttl,
            },
        );
        inner.order.push(key);
    }

    pub async fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().await;
        inner.map.remove(key);
        inner.order.retain(|k| k != key);
    }

    /// Drops every entry — used when a mutation invalidates the whole cache.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.map.clear();
        inner.order.clear();
    }

    /// Removes every expired entry; intended to be driven by a periodic
    /// background sweep.
    pub async fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let expired: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, slot)| now >= slot.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.map.remove(key);
            inner.order.retain(|k| k != key);
        }
        expired.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.map.len(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_then_hit_updates_counters() {
        let cache: LruTtlCache<&str, i32> = LruTtlCache::new(10);
        assert_eq!(cache.get(&"k").await, None);
        cache.set("k", 1, chrono::Duration::seconds(60)).await;
        assert_eq!(cache.get(&"k").await, Some(1));
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn expired_entry_is_never_returned() {
        let cache: LruTtlCache<&str, i32> = LruTtlCache::new(10);
        cache.set("k", 1, chrono::Duration::milliseconds(1)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(cache.get(&"k").await, None);
    }

    #[tokio::test]
    async fn eviction_respects_capacity_and_recency() {
        let cache: LruTtlCache<i32, i32> = LruTtlCache::new(2);
        cache.set(1, 1, chrono::Duration::seconds(60)).await;
        cache.set(2, 2, chrono::Duration::seconds(60)).await;
        // Touch 1 so it becomes most-recent; 2 becomes the eviction candidate.
        assert_eq!(cache.get(&1).await, Some(1));
        cache.set(3, 3, chrono::Duration::seconds(60)).await;

        let stats = cache.stats().await;
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(cache.get(&2).await, None);
        assert_eq!(cache.get(&1).await, Some(1));
        assert_eq!(cache.get(&3).await, Some(3));
    }

    #[tokio::test]
    async fn clear_empties_cache() {
        let cache: LruTtlCache<&str, i32> = LruTtlCache::new(10);
        cache.set("k", 1, chrono::Duration::seconds(60)).await;
        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let cache: LruTtlCache<&str, i32> = LruTtlCache::new(10);
        cache.set("short", 1, chrono::Duration::milliseconds(1)).await;
        cache.set("long", 2, chrono::Duration::seconds(60)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let removed = cache.sweep_expired().await;
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 1);
    }
}
