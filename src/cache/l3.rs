//! L3 Tier - Pluggable Slow Backend
//!
//! The slowest, largest tier sits behind an async trait so it can be volatile
//! memory or durable disk.
//!
//! # Design
//!
//! - Every backend call is bounded by a deadline
//! - A failed or timed-out call marks the tier unavailable until the next
//!   successful call; callers degrade to L1/L2

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::clock::Clock;
use super::entry::{CacheEntry, EntryInfo};
use super::policy::Tier;
use super::store::EntryStore;
use crate::config::TierConfig;
use crate::error::{Error, Result};

/// L3 storage backend trait
#[async_trait]
pub trait L3Backend: Send + Sync {
    /// Backend name for logs and errors
    fn name(&self) -> &'static str;

    /// Get a live entry, recording the access
    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry>>>;

    /// Get a live entry without access bookkeeping
    async fn peek(&self, key: &str) -> Result<Option<Arc<CacheEntry>>>;

    /// Store an entry; returns keys evicted to make room
    async fn put(&self, entry: CacheEntry) -> Result<Vec<String>>;

    /// Remove an entry
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Live keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Metadata of live entries
    async fn infos(&self) -> Result<Vec<EntryInfo>>;

    /// Stored entry count
    async fn len(&self) -> Result<usize>;

    /// Sum of stored payload sizes
    async fn memory_usage(&self) -> Result<u64>;

    /// Drop expired entries; returns the number removed
    async fn purge_expired(&self) -> Result<usize>;

    /// Get backend statistics
    fn stats(&self) -> L3BackendStats;
}

/// L3 backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L3BackendStats {
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

/// Operation counters shared by backend implementations
#[derive(Debug, Default)]
pub(crate) struct BackendOps {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl BackendOps {
    pub(crate) fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> L3BackendStats {
        L3BackendStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// Volatile L3 backend over an [`EntryStore`]
pub struct InMemoryL3Backend {
    store: EntryStore,
    ops: BackendOps,
}

impl InMemoryL3Backend {
    /// Create a new in-memory backend
    pub fn new(config: &TierConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: EntryStore::new(Tier::L3, config, clock),
            ops: BackendOps::default(),
        }
    }
}

#[async_trait]
impl L3Backend for InMemoryL3Backend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
        self.ops.read();
        Ok(self.store.get(key))
    }

    async fn peek(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
        Ok(self.store.peek(key))
    }

    async fn put(&self, entry: CacheEntry) -> Result<Vec<String>> {
        self.ops.write();
        Ok(self.store.set(entry))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ops.delete();
        Ok(self.store.delete(key))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.store.keys())
    }

    async fn infos(&self) -> Result<Vec<EntryInfo>> {
        Ok(self.store.infos())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.store.len())
    }

    async fn memory_usage(&self) -> Result<u64> {
        Ok(self.store.memory_usage())
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(self.store.purge_expired())
    }

    fn stats(&self) -> L3BackendStats {
        self.ops.snapshot()
    }
}

// =============================================================================
// L3 Tier
// =============================================================================

/// Deadline-bounded wrapper around an [`L3Backend`]
pub struct L3Tier {
    backend: Arc<dyn L3Backend>,
    timeout: Duration,
    available: AtomicBool,
}

impl L3Tier {
    pub fn new(backend: Arc<dyn L3Backend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            available: AtomicBool::new(true),
        }
    }

    /// False after a failed call, until the next successful one
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> &Arc<dyn L3Backend> {
        &self.backend
    }

    pub async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
        self.call("get", self.backend.get(key)).await
    }

    pub async fn peek(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
        self.call("peek", self.backend.peek(key)).await
    }

    pub async fn put(&self, entry: CacheEntry) -> Result<Vec<String>> {
        self.call("put", self.backend.put(entry)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.call("delete", self.backend.delete(key)).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.call("keys", self.backend.keys()).await
    }

    pub async fn infos(&self) -> Result<Vec<EntryInfo>> {
        self.call("infos", self.backend.infos()).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.call("len", self.backend.len()).await
    }

    pub async fn memory_usage(&self) -> Result<u64> {
        self.call("memory_usage", self.backend.memory_usage()).await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.call("purge_expired", self.backend.purge_expired()).await
    }

    async fn call<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let backend = self.backend.name();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::BackendTimeout {
                backend: backend.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(_) => {
                if !self.available.swap(true, Ordering::Relaxed) {
                    info!(backend, "L3 backend recovered");
                }
            }
            Err(e) => {
                self.available.store(false, Ordering::Relaxed);
                warn!(backend, op, error = %e, "L3 backend call failed, degrading to L1/L2");
            }
        }

        result
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn backend(clock: Arc<ManualClock>) -> Arc<InMemoryL3Backend> {
        Arc::new(InMemoryL3Backend::new(&TierConfig::l3_defaults(), clock))
    }

    fn entry(key: &str, now: i64) -> CacheEntry {
        CacheEntry::new(key, Bytes::from_static(b"data"), 4, false, 600, now).in_tier(Tier::L3)
    }

    /// Backend that never answers in time
    struct StalledBackend;

    #[async_trait]
    impl L3Backend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }
        async fn get(&self, _key: &str) -> Result<Option<Arc<CacheEntry>>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
        async fn peek(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
            self.get(key).await
        }
        async fn put(&self, _entry: CacheEntry) -> Result<Vec<String>> {
            Err(Error::BackendUnavailable {
                backend: "stalled".into(),
                reason: "read-only".into(),
            })
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn infos(&self) -> Result<Vec<EntryInfo>> {
            Ok(Vec::new())
        }
        async fn len(&self) -> Result<usize> {
            Ok(0)
        }
        async fn memory_usage(&self) -> Result<u64> {
            Ok(0)
        }
        async fn purge_expired(&self) -> Result<usize> {
            Ok(0)
        }
        fn stats(&self) -> L3BackendStats {
            L3BackendStats::default()
        }
    }

    #[tokio::test]
    async fn test_in_memory_backend_put_get() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = backend(clock);

        backend.put(entry("analytics:1", 0)).await.unwrap();
        let hit = backend.get("analytics:1").await.unwrap().unwrap();
        assert_eq!(hit.payload().as_ref(), b"data");
        assert_eq!(hit.tier(), Tier::L3);

        assert!(backend.delete("analytics:1").await.unwrap());
        assert!(backend.get("analytics:1").await.unwrap().is_none());

        let stats = backend.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.deletes, 1);
    }

    #[tokio::test]
    async fn test_in_memory_backend_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = backend(clock.clone());
        backend.put(entry("a", 0)).await.unwrap();

        clock.advance(Duration::from_secs(601));
        assert!(backend.peek("a").await.unwrap().is_none());
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert_eq!(backend.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tier_passthrough_keeps_available() {
        let clock = Arc::new(ManualClock::new(0));
        let tier = L3Tier::new(backend(clock), Duration::from_millis(250));

        tier.put(entry("k", 0)).await.unwrap();
        assert!(tier.get("k").await.unwrap().is_some());
        assert_eq!(tier.keys().await.unwrap(), vec!["k".to_string()]);
        assert_eq!(tier.memory_usage().await.unwrap(), 4);
        assert!(tier.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_unavailable() {
        let tier = L3Tier::new(Arc::new(StalledBackend), Duration::from_millis(250));

        let result = tier.get("k").await;
        assert_matches!(result, Err(Error::BackendTimeout { timeout_ms: 250, .. }));
        assert!(!tier.is_available());

        // Next successful call restores availability
        assert!(!tier.delete("k").await.unwrap());
        assert!(tier.is_available());
    }

    #[tokio::test]
    async fn test_error_marks_unavailable() {
        let tier = L3Tier::new(Arc::new(StalledBackend), Duration::from_millis(250));
        let result = tier.put(entry("k", 0)).await;
        assert_matches!(result, Err(Error::BackendUnavailable { .. }));
        assert!(!tier.is_available());
    }
}
