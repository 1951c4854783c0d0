//! Stratacache - Embeddable Three-Tier Cache
//!
//! A single-process cache with three tiers of decreasing speed and
//! increasing capacity, automatic placement and promotion, tag and pattern
//! invalidation with dependency cascades, LZ4 compression of large values,
//! and health monitoring.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ Cache<V> ──▶ L1 ──▶ L2 ──▶ L3 (memory | disk)
//!               │          ▲      ▲      │
//!               │          └──────┴──────┘ promotion on hit
//!               ▼
//!      MetricsCollector ──▶ HealthMonitor ──▶ PrometheusExporter, alerts
//! ```
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use stratacache::{Cache, CacheConfig, OperationContext, SetOptions};
//!
//! # async fn run() -> stratacache::Result<()> {
//! let cache: Cache = Cache::new(CacheConfig::default()).await?;
//! cache
//!     .set("user:42", &json!({"name": "Ada"}), SetOptions::new().tag("users"))
//!     .await?;
//! let user = cache.get("user:42", &OperationContext::new()).await;
//! assert!(user.is_some());
//! cache.invalidate(stratacache::Invalidation::tag("users"), &OperationContext::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tier stores, placement, invalidation and the cache facade
//! - [`config`] - YAML configuration
//! - [`error`] - Error types
//! - [`monitoring`] - Health evaluation, alerts and Prometheus exposition

pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;

// Re-export commonly used types
pub use cache::{
    BackgroundTasks, Cache, Entry, EntryInfo, EvictionPolicy, Invalidation, InvalidationQuery,
    InvalidationRule, OperationContext, PatternRule, SetOptions, Tier, TierChoice, TierMetrics,
};
pub use config::{CacheConfig, HealthConfig, L3BackendConfig, TierConfig};
pub use error::{Error, Result};
pub use monitoring::{Alert, HealthReport, HealthStatus};
