//! Sharded Map Implementation
//!
//! Concurrent hashmap split into power-of-two shards, one RwLock each.
//!
//! # Design
//!
//! - Readers take a shard read lock; writers lock only the key's shard
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Per-shard counters are kept outside the lock

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Single shard containing a hashmap and its entry count
pub struct Shard<V> {
    /// The hashmap for this shard
    map: RwLock<HashMap<String, V>>,
    /// Number of entries
    count: AtomicU64,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Shard<V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            count: AtomicU64::new(0),
        }
    }

    /// Get the number of entries in this shard
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    /// Check if the shard is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a closure under the shard read lock
    pub fn with_read<R>(&self, f: impl FnOnce(&HashMap<String, V>) -> R) -> R {
        let guard = self.map.read();
        f(&guard)
    }

    /// Run a closure under the shard write lock
    ///
    /// The entry count is resynchronised after the closure returns.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut HashMap<String, V>) -> R) -> R {
        let mut guard = self.map.write();
        let result = f(&mut guard);
        self.count.store(guard.len() as u64, Ordering::Relaxed);
        result
    }
}

impl<V: Clone> Shard<V> {
    /// Get a value from the shard
    pub fn get(&self, key: &str) -> Option<V> {
        self.with_read(|map| map.get(key).cloned())
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &str) -> bool {
        self.with_read(|map| map.contains_key(key))
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&self, key: String, value: V) -> Option<V> {
        self.with_write(|map| map.insert(key, value))
    }

    /// Remove a value, returning it if present
    pub fn remove(&self, key: &str) -> Option<V> {
        self.with_write(|map| map.remove(key))
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.with_write(|map| map.clear());
    }

    /// Get all keys
    pub fn keys(&self) -> Vec<String> {
        self.with_read(|map| map.keys().cloned().collect())
    }

    /// Get all values
    pub fn values(&self) -> Vec<V> {
        self.with_read(|map| map.values().cloned().collect())
    }
}

/// Sharded map with a runtime shard count
pub struct ShardedMap<V> {
    shards: Vec<Shard<V>>,
    mask: usize,
}

impl<V> ShardedMap<V> {
    /// Create a new sharded map
    ///
    /// The shard count is rounded up to a power of two.
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        Self {
            shards: (0..count).map(|_| Shard::new()).collect(),
            mask: count - 1,
        }
    }

    /// Get the shard count
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for a key
    #[inline]
    pub fn shard_index(&self, key: &str) -> usize {
        (fx_hash(key.as_bytes()) as usize) & self.mask
    }

    /// Shard owning a key
    #[inline]
    pub fn shard_for(&self, key: &str) -> &Shard<V> {
        &self.shards[self.shard_index(key)]
    }

    /// Get a shard by index
    #[inline]
    pub fn shard(&self, index: usize) -> &Shard<V> {
        &self.shards[index & self.mask]
    }

    /// Iterate over shards
    pub fn shards(&self) -> impl Iterator<Item = &Shard<V>> {
        self.shards.iter()
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }
}

impl<V: Clone> ShardedMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.shard_for(key).get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shard_for(key).contains_key(key)
    }

    pub fn insert(&self, key: String, value: V) -> Option<V> {
        self.shard_for(&key).insert(key, value)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard_for(key).remove(key)
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.shards.iter().flat_map(|s| s.keys()).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.shards.iter().flat_map(|s| s.values()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shard_count_rounding() {
        assert_eq!(ShardedMap::<u32>::new(0).shard_count(), 1);
        assert_eq!(ShardedMap::<u32>::new(10).shard_count(), 16);
        assert_eq!(ShardedMap::<u32>::new(64).shard_count(), 64);
    }

    #[test]
    fn test_insert_get_remove() {
        let map: ShardedMap<u32> = ShardedMap::new(8);
        assert!(map.is_empty());

        assert!(map.insert("a".into(), 1).is_none());
        assert_eq!(map.insert("a".into(), 2), Some(1));
        assert_eq!(map.get("a"), Some(2));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove("a"), Some(2));
        assert!(map.remove("a").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_shard_distribution() {
        let map: ShardedMap<u32> = ShardedMap::new(16);
        let mut counts = vec![0usize; 16];
        for i in 0..10_000 {
            counts[map.shard_index(&format!("key-{}", i))] += 1;
        }
        let max = *counts.iter().max().unwrap();
        assert!(max < 1_000, "Uneven distribution: max count {}", max);
    }

    #[test]
    fn test_with_write_resyncs_count() {
        let map: ShardedMap<u32> = ShardedMap::new(1);
        map.insert("a".into(), 1);
        map.insert("b".into(), 2);

        map.shard(0).with_write(|m| m.retain(|k, _| k == "a"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.keys(), vec!["a".to_string()]);
    }

    #[test]
    fn test_concurrent_writers() {
        let map: Arc<ShardedMap<usize>> = Arc::new(ShardedMap::new(16));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..500 {
                        map.insert(format!("{}-{}", t, i), i);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 4_000);
    }
}
