//! Entry Store - Bounded In-Memory Tier
//!
//! Backs L1, L2 and the in-memory L3 backend.
//!
//! # Design
//!
//! - ShardedMap with one RwLock per shard; reads never block other shards
//! - Hard `max_keys` cap enforced by slot reservation, not a global lock
//! - Expired entries are dropped lazily on touch and by `purge_expired`
//! - Victims come from the target key's shard first, other shards if empty

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::clock::Clock;
use super::entry::{CacheEntry, EntryInfo};
use super::policy::{EvictionPolicy, Tier};
use super::shard::ShardedMap;
use crate::config::TierConfig;

/// Bounded key/value store for one tier
pub struct EntryStore {
    /// Owning tier
    tier: Tier,
    /// Sharded storage
    entries: ShardedMap<Arc<CacheEntry>>,
    /// Capacity
    max_keys: usize,
    /// Victim selection
    eviction: EvictionPolicy,
    /// Reserved or occupied slots
    slots: AtomicUsize,
    /// Time source
    clock: Arc<dyn Clock>,
}

impl EntryStore {
    /// Create a store for a tier
    pub fn new(tier: Tier, config: &TierConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            tier,
            entries: ShardedMap::new(config.shards),
            max_keys: config.max_keys.max(1),
            eviction: config.eviction,
            slots: AtomicUsize::new(0),
            clock,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// Get a live entry, recording the access
    ///
    /// An expired entry found here is removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let now = self.clock.now_millis();
        let entry = self.entries.get(key)?;

        if entry.is_expired(now) {
            self.remove_if_expired(key, now);
            return None;
        }

        entry.record_access(now);
        Some(entry)
    }

    /// Get a live entry without access bookkeeping
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let now = self.clock.now_millis();
        self.entries.get(key).filter(|e| !e.is_expired(now))
    }

    /// Check for a live entry
    pub fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Insert or replace an entry
    ///
    /// Returns the keys evicted to make room. Replacing an existing key never
    /// evicts.
    pub fn set(&self, entry: CacheEntry) -> Vec<String> {
        let key = entry.key().to_string();
        let entry = Arc::new(entry);
        let shard_index = self.entries.shard_index(&key);
        let shard = self.entries.shard(shard_index);

        let replaced = shard.with_write(|map| match map.get_mut(&key) {
            Some(slot) => {
                *slot = Arc::clone(&entry);
                true
            }
            None => false,
        });
        if replaced {
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while !self.try_reserve() {
            let removed = self.evict_one(shard_index);
            if removed.is_empty() {
                // Every shard is empty but slots are still reserved by
                // concurrent writers; take a slot anyway.
                self.slots.fetch_add(1, Ordering::AcqRel);
                break;
            }
            evicted.extend(removed);
        }

        if shard.with_write(|map| map.insert(key, entry)).is_some() {
            // Lost a race with a concurrent insert of the same key
            self.release(1);
        }

        evicted
    }

    /// Remove a key, reporting whether it was stored
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.release(1);
        }
        removed
    }

    /// Live keys
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        self.entries
            .shards()
            .flat_map(|shard| {
                shard.with_read(|map| {
                    map.iter()
                        .filter(|(_, e)| !e.is_expired(now))
                        .map(|(k, _)| k.clone())
                        .collect::<Vec<_>>()
                })
            })
            .collect()
    }

    /// Stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry; returns the number removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut purged = 0;

        for shard in self.entries.shards() {
            purged += shard.with_write(|map| {
                let before = map.len();
                map.retain(|_, e| !e.is_expired(now));
                before - map.len()
            });
        }

        if purged > 0 {
            self.release(purged);
            debug!(tier = %self.tier, purged, "Purged expired entries");
        }
        purged
    }

    /// Metadata of live entries
    pub fn infos(&self) -> Vec<EntryInfo> {
        let now = self.clock.now_millis();
        self.entries
            .values()
            .into_iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.info())
            .collect()
    }

    /// Sum of stored payload sizes
    pub fn memory_usage(&self) -> u64 {
        self.entries
            .shards()
            .map(|shard| shard.with_read(|map| map.values().map(|e| e.stored_size()).sum::<u64>()))
            .sum()
    }

    pub fn clear(&self) {
        for shard in self.entries.shards() {
            let removed = shard.with_write(|map| {
                let n = map.len();
                map.clear();
                n
            });
            self.release(removed);
        }
    }

    fn try_reserve(&self) -> bool {
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_keys).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self, n: usize) {
        let _ = self
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(n))
            });
    }

    fn remove_if_expired(&self, key: &str, now: i64) {
        let removed = self.entries.shard_for(key).with_write(|map| {
            if map.get(key).is_some_and(|e| e.is_expired(now)) {
                map.remove(key).is_some()
            } else {
                false
            }
        });
        if removed {
            self.release(1);
        }
    }

    /// Free at least one slot, starting at the given shard
    ///
    /// Expired entries of a shard are removed before any live victim is
    /// chosen from it.
    fn evict_one(&self, start: usize) -> Vec<String> {
        let now = self.clock.now_millis();
        let count = self.entries.shard_count();
        let policy = self.eviction;

        for offset in 0..count {
            let shard = self.entries.shard(start + offset);
            let removed = shard.with_write(|map| {
                let expired: Vec<String> = map
                    .iter()
                    .filter(|(_, e)| e.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect();
                if !expired.is_empty() {
                    for key in &expired {
                        map.remove(key);
                    }
                    return expired;
                }

                let victim = map
                    .iter()
                    .min_by_key(|(_, e)| policy.rank(e.last_accessed(), e.access_count()))
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(key) => {
                        map.remove(&key);
                        vec![key]
                    }
                    None => Vec::new(),
                }
            });

            if !removed.is_empty() {
                self.release(removed.len());
                debug!(tier = %self.tier, keys = ?removed, "Evicted entries");
                return removed;
            }
        }

        Vec::new()
    }
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("tier", &self.tier)
            .field("len", &self.len())
            .field("max_keys", &self.max_keys)
            .field("eviction", &self.eviction)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use bytes::Bytes;
    use std::time::Duration;

    fn config(max_keys: usize, shards: usize, eviction: EvictionPolicy) -> TierConfig {
        TierConfig {
            max_keys,
            shards,
            eviction,
            ..TierConfig::l1_defaults()
        }
    }

    fn entry(key: &str, ttl: u64, now: i64) -> CacheEntry {
        CacheEntry::new(key, Bytes::from(key.to_string()), key.len() as u64, false, ttl, now)
    }

    fn store(max_keys: usize, shards: usize, eviction: EvictionPolicy) -> (EntryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = EntryStore::new(Tier::L1, &config(max_keys, shards, eviction), clock.clone());
        (store, clock)
    }

    #[test]
    fn test_set_get_delete() {
        let (store, clock) = store(10, 4, EvictionPolicy::Lru);
        let now = clock.now_millis();

        assert!(store.set(entry("a", 60, now)).is_empty());
        let hit = store.get("a").unwrap();
        assert_eq!(hit.payload().as_ref(), b"a");
        assert_eq!(hit.access_count(), 1);

        assert!(store.contains("a"));
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert!(store.get("a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_lazy_expiry_removes_entry() {
        let (store, clock) = store(10, 4, EvictionPolicy::Lru);
        store.set(entry("a", 5, clock.now_millis()));

        clock.advance(Duration::from_secs(5));
        assert!(store.get("a").is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.peek("a").is_none());
        assert_eq!(store.len(), 1);
        assert!(store.get("a").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_peek_skips_bookkeeping() {
        let (store, clock) = store(10, 4, EvictionPolicy::Lru);
        store.set(entry("a", 60, clock.now_millis()));
        store.peek("a");
        assert_eq!(store.peek("a").unwrap().access_count(), 0);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let (store, clock) = store(2, 1, EvictionPolicy::Lru);
        let now = clock.now_millis();
        store.set(entry("a", 60, now));
        store.set(entry("b", 60, now));
        assert!(store.set(entry("a", 120, now)).is_empty());
        assert_eq!(store.len(), 2);
        assert_eq!(store.peek("a").unwrap().ttl(), 120);
    }

    #[test]
    fn test_lru_eviction() {
        let (store, clock) = store(3, 1, EvictionPolicy::Lru);
        for key in ["a", "b", "c"] {
            store.set(entry(key, 600, clock.now_millis()));
            clock.advance(Duration::from_millis(10));
        }

        // Touch a and b so c is least recently used
        store.get("a");
        clock.advance(Duration::from_millis(10));
        store.get("b");

        let evicted = store.set(entry("d", 600, clock.now_millis()));
        assert_eq!(evicted, vec!["c".to_string()]);
        assert_eq!(store.len(), 3);
        assert!(store.contains("a"));
        assert!(store.contains("d"));
    }

    #[test]
    fn test_lfu_eviction() {
        let (store, clock) = store(3, 1, EvictionPolicy::Lfu);
        for key in ["a", "b", "c"] {
            store.set(entry(key, 600, clock.now_millis()));
        }
        for _ in 0..3 {
            store.get("a");
            store.get("c");
        }
        store.get("b");

        let evicted = store.set(entry("d", 600, clock.now_millis()));
        assert_eq!(evicted, vec!["b".to_string()]);
    }

    #[test]
    fn test_expired_evicted_first() {
        let (store, clock) = store(2, 1, EvictionPolicy::Lru);
        store.set(entry("short", 1, clock.now_millis()));
        clock.advance(Duration::from_millis(10));
        store.set(entry("long", 600, clock.now_millis()));
        store.get("short");

        clock.advance(Duration::from_secs(2));
        let evicted = store.set(entry("new", 600, clock.now_millis()));
        assert_eq!(evicted, vec!["short".to_string()]);
        assert!(store.contains("long"));
    }

    #[test]
    fn test_eviction_falls_back_to_other_shards() {
        let (store, clock) = store(4, 16, EvictionPolicy::Lru);
        for i in 0..4 {
            store.set(entry(&format!("k{}", i), 600, clock.now_millis()));
        }

        // Find a key whose shard is currently empty
        let lonely = (0..1000)
            .map(|i| format!("x{}", i))
            .find(|k| {
                store.entries.shard_for(k).is_empty()
            })
            .unwrap();

        let evicted = store.set(entry(&lonely, 600, clock.now_millis()));
        assert_eq!(evicted.len(), 1);
        assert_eq!(store.len(), 4);
        assert!(store.contains(&lonely));
    }

    #[test]
    fn test_hard_cap_under_concurrency() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(EntryStore::new(
            Tier::L2,
            &config(64, 8, EvictionPolicy::Lru),
            clock,
        ));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        store.set(entry(&format!("{}-{}", t, i), 600, 0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(store.len() <= 64, "len {} exceeds cap", store.len());
    }

    #[test]
    fn test_purge_and_infos() {
        let (store, clock) = store(10, 4, EvictionPolicy::Lru);
        let now = clock.now_millis();
        store.set(entry("a", 1, now));
        store.set(entry("bb", 600, now));

        assert_eq!(store.memory_usage(), 3);
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.keys(), vec!["bb".to_string()]);
        assert_eq!(store.infos().len(), 1);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.memory_usage(), 2);

        store.clear();
        assert!(store.is_empty());
        // Slots are released; the store fills again without evicting
        for i in 0..10 {
            assert!(store.set(entry(&format!("k{}", i), 60, now)).is_empty());
        }
    }
}
