//! Cache Metrics Collection
//!
//! Per-tier atomic counters, updated on every operation and snapshotted into
//! [`TierMetrics`] for health checks and export.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::policy::Tier;

/// EMA smoothing factor
const EMA_ALPHA: f64 = 0.1;

/// Point-in-time metrics for one tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierMetrics {
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses); 0 with no observations
    pub hit_rate: f64,
    pub total_keys: u64,
    /// Sum of stored entry sizes in bytes
    pub memory_usage: u64,
    pub evictions: u64,
    /// Stored bytes / original bytes over compressed writes; 1.0 when none
    pub compression_ratio: f64,
    /// Exponential moving average of read time
    pub average_access_time_us: f64,
    /// Promotions landing in this tier
    pub promotions_in: u64,
    /// Backing store failures and timeouts
    pub backend_errors: u64,
}

impl TierMetrics {
    /// Reads observed by this tier
    pub fn observations(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Atomic counters for one tier
#[derive(Debug, Default)]
pub struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    promotions_in: AtomicU64,
    backend_errors: AtomicU64,
    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
    /// EMA of read time in nanoseconds
    access_time_ns: AtomicU64,
    total_keys: AtomicU64,
    memory_usage: AtomicU64,
}

impl TierCounters {
    pub fn record_hit(&self, elapsed: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.update_access_time(elapsed);
    }

    pub fn record_miss(&self, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.update_access_time(elapsed);
    }

    pub fn record_evictions(&self, count: u64) {
        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_promotion(&self) {
        self.promotions_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a compressed write
    pub fn record_compression(&self, original: u64, stored: u64) {
        self.original_bytes.fetch_add(original, Ordering::Relaxed);
        self.compressed_bytes.fetch_add(stored, Ordering::Relaxed);
    }

    /// Refresh the key count and memory gauges
    pub fn update_gauges(&self, total_keys: u64, memory_usage: u64) {
        self.total_keys.store(total_keys, Ordering::Relaxed);
        self.memory_usage.store(memory_usage, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn compression_ratio(&self) -> f64 {
        let original = self.original_bytes.load(Ordering::Relaxed);
        if original == 0 {
            return 1.0;
        }
        self.compressed_bytes.load(Ordering::Relaxed) as f64 / original as f64
    }

    pub fn average_access_time(&self) -> Duration {
        Duration::from_nanos(self.access_time_ns.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> TierMetrics {
        TierMetrics {
            hits: self.hits(),
            misses: self.misses(),
            hit_rate: self.hit_ratio(),
            total_keys: self.total_keys.load(Ordering::Relaxed),
            memory_usage: self.memory_usage.load(Ordering::Relaxed),
            evictions: self.evictions(),
            compression_ratio: self.compression_ratio(),
            average_access_time_us: self.access_time_ns.load(Ordering::Relaxed) as f64 / 1_000.0,
            promotions_in: self.promotions_in.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }

    fn update_access_time(&self, elapsed: Duration) {
        let new_ns = elapsed.as_nanos().min(u64::MAX as u128) as u64;

        loop {
            let current = self.access_time_ns.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_ns
            } else {
                ((1.0 - EMA_ALPHA) * current as f64 + EMA_ALPHA * new_ns as f64) as u64
            };

            if self
                .access_time_ns
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
}

/// Counters for all three tiers
#[derive(Debug, Default)]
pub struct MetricsCollector {
    tiers: [TierCounters; 3],
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn tier(&self, tier: Tier) -> &TierCounters {
        &self.tiers[tier.index()]
    }

    pub fn snapshot(&self, tier: Tier) -> TierMetrics {
        self.tier(tier).snapshot()
    }

    pub fn snapshot_all(&self) -> BTreeMap<Tier, TierMetrics> {
        Tier::ALL.iter().map(|&t| (t, self.snapshot(t))).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
