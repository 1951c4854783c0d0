//! Multi-Tier Cache
//!
//! Three entry stores behind one facade, fastest first.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Cache<V>                                │
//! │   TierSelector · Compressor · InvalidationIndex · MetricsCollector   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  L1 (hot, small)      │ L2 (warm, medium)    │ L3 (cold, backend)    │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌──────────────────┐  │
//! │  │ EntryStore     │   │ │ EntryStore     │   │ │ L3Tier           │  │
//! │  │ ShardedMap     │   │ │ ShardedMap     │   │ │  memory | disk   │  │
//! │  └────────────────┘   │ └────────────────┘   │ └──────────────────┘  │
//! │          ▲                     ▲                       │             │
//! │          └──── promotion ──────┴───── promotion ───────┘             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Placement
//!
//! - Pattern table first (first rule whose pattern occurs in the key)
//! - Otherwise by serialized size: under 1KB in L1, under 10KB in L2, else L3
//! - Writes replicate into faster tiers, capped at their default TTL
//! - Reads promote one tier up with the remaining lifetime

mod clock;
mod disk;
mod entry;
mod invalidation;
mod l3;
mod maintenance;
mod manager;
mod metrics;
mod policy;
mod shard;
mod store;
pub mod compression;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compression::Compressor;
pub use disk::DiskL3Backend;
pub use entry::{CacheEntry, EntryInfo};
pub use invalidation::{
    normalize_prefix, Invalidation, InvalidationIndex, InvalidationQuery, InvalidationRule,
};
pub use l3::{InMemoryL3Backend, L3Backend, L3BackendStats, L3Tier};
pub use maintenance::BackgroundTasks;
pub use manager::{open_backend, Cache, Entry, OperationContext, SetOptions};
pub use metrics::{MetricsCollector, TierCounters, TierMetrics};
pub use policy::{EvictionPolicy, PatternRule, Tier, TierChoice, TierSelector};
pub use shard::{Shard, ShardedMap};
pub use store::EntryStore;

pub use crate::config::DEFAULT_COMPRESSION_THRESHOLD;

/// Values smaller than this are placed in L1 by size
pub const L1_SIZE_LIMIT: u64 = 1024;

/// Values smaller than this are placed in L2 by size
pub const L2_SIZE_LIMIT: u64 = 10 * 1024;

// =============================================================================
// Tests
// =============================================================================
