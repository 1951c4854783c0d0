//! Cache Facade - Unified Three-Tier Cache
//!
//! Orchestrates L1, L2 and L3 with promotion on hit, write replication into
//! faster tiers, compression and cascading invalidation.
//!
//! # Read path
//!
//! ```text
//! get ──▶ L1 ──miss──▶ L2 ──miss──▶ L3 ──miss──▶ None
//!          │            │            │
//!         hit          hit          hit
//!          │            ├─promote─▶ L1
//!          │            │            ├─promote─▶ L2
//!          ▼            ▼            ▼
//!                     value
//! ```
//!
//! Promotions are promotion-only: an L3 hit lands in L2, not L1. A later L2
//! hit carries it on to L1.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use super::compression::Compressor;
use super::disk::DiskL3Backend;
use super::entry::{CacheEntry, EntryInfo};
use super::invalidation::{Invalidation, InvalidationIndex};
use super::l3::{InMemoryL3Backend, L3Backend, L3Tier};
use super::metrics::{MetricsCollector, TierMetrics};
use super::policy::{Tier, TierChoice, TierSelector};
use super::store::EntryStore;
use crate::config::{CacheConfig, L3BackendConfig, MAX_TTL_SECS};
use crate::error::{Error, Result};
use crate::monitoring::{Alert, HealthReport};

/// Alert channel capacity
const ALERT_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Request Types
// =============================================================================

/// Per-write options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// TTL in seconds; falls back to the pattern table, then the tier default
    pub ttl: Option<u64>,
    /// Target tier
    pub tier: TierChoice,
    /// Invalidation tags
    pub tags: Vec<String>,
    /// Free-form attributes (`tenant` is used by queries)
    pub metadata: HashMap<String, String>,
    /// Write only the resolved tier, without replicating into faster tiers
    pub promotion_only: bool,
    /// `get_or_set` only: bypass the lookup and always run the loader
    pub skip_cache: bool,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn tier(mut self, tier: impl Into<TierChoice>) -> Self {
        self.tier = tier.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Shorthand for the `tenant` metadata attribute
    pub fn tenant(self, tenant: impl Into<String>) -> Self {
        self.metadata("tenant", tenant)
    }

    pub fn promotion_only(mut self) -> Self {
        self.promotion_only = true;
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }
}

/// Caller identity, recorded on tracing spans only
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationContext {
    pub tenant: Option<String>,
    pub user: Option<String>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// One item of a batch write
#[derive(Debug, Clone)]
pub struct Entry<V> {
    pub key: String,
    pub value: V,
    pub options: SetOptions,
}

impl<V> Entry<V> {
    pub fn new(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value,
            options: SetOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SetOptions) -> Self {
        self.options = options;
        self
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Three-tier cache
///
/// Values cross the API as `V` and are stored as JSON bytes.
pub struct Cache<V = serde_json::Value> {
    config: CacheConfig,
    l1: EntryStore,
    l2: EntryStore,
    l3: L3Tier,
    selector: TierSelector,
    compressor: Compressor,
    index: InvalidationIndex,
    metrics: MetricsCollector,
    clock: Arc<dyn Clock>,
    alerts: broadcast::Sender<Alert>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Cache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a cache from configuration using the wall clock
    pub async fn new(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// Build a cache from configuration with an explicit time source
    pub async fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config, Arc::clone(&clock)).await?;
        Self::with_backend(config, backend, clock)
    }

    /// Build a cache around an existing L3 backend
    pub fn with_backend(
        config: CacheConfig,
        backend: Arc<dyn L3Backend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);

        info!(
            l3_backend = backend.name(),
            l1_max_keys = config.l1.max_keys,
            l2_max_keys = config.l2.max_keys,
            l3_max_keys = config.l3.max_keys,
            "Initializing cache"
        );

        Ok(Self {
            l1: EntryStore::new(Tier::L1, &config.l1, Arc::clone(&clock)),
            l2: EntryStore::new(Tier::L2, &config.l2, Arc::clone(&clock)),
            l3: L3Tier::new(backend, config.l3_timeout()),
            selector: TierSelector::new(config.patterns.clone()),
            compressor: Compressor::new(config.compression_threshold),
            index: InvalidationIndex::new(config.invalidation_rules.clone()),
            metrics: MetricsCollector::new(),
            clock,
            alerts,
            config,
            _marker: PhantomData,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn index(&self) -> &InvalidationIndex {
        &self.index
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look a key up, fastest tier first
    ///
    /// Misses and undecodable values are `None`, never errors.
    #[instrument(level = "debug", skip_all, fields(key = key, tenant = ctx.tenant.as_deref(), user = ctx.user.as_deref()))]
    pub async fn get(&self, key: &str, ctx: &OperationContext) -> Option<V> {
        let entry = self.lookup(key).await?;
        match self.decode(&entry) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Dropping undecodable cache entry");
                self.remove_everywhere(key).await;
                None
            }
        }
    }

    /// Look up several keys concurrently; misses are omitted
    pub async fn mget<K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, V> {
        let ctx = OperationContext::default();
        let lookups = keys.iter().map(|key| {
            let ctx = &ctx;
            async move {
                let key = key.as_ref();
                self.get(key, ctx).await.map(|value| (key.to_string(), value))
            }
        });

        futures::future::join_all(lookups)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Metadata of one tier's copy, without access bookkeeping
    pub async fn peek(&self, tier: Tier, key: &str) -> Option<EntryInfo> {
        match tier {
            Tier::L1 => self.l1.peek(key).map(|e| e.info()),
            Tier::L2 => self.l2.peek(key).map(|e| e.info()),
            Tier::L3 => match self.l3.peek(key).await {
                Ok(entry) => entry.map(|e| e.info()),
                Err(_) => {
                    self.metrics.tier(Tier::L3).record_backend_error();
                    None
                }
            },
        }
    }

    async fn lookup(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let start = Instant::now();
        if let Some(entry) = self.l1.get(key) {
            self.metrics.tier(Tier::L1).record_hit(start.elapsed());
            return Some(entry);
        }
        self.metrics.tier(Tier::L1).record_miss(start.elapsed());

        let start = Instant::now();
        if let Some(entry) = self.l2.get(key) {
            self.metrics.tier(Tier::L2).record_hit(start.elapsed());
            self.promote(&entry, Tier::L1);
            return Some(entry);
        }
        self.metrics.tier(Tier::L2).record_miss(start.elapsed());

        let start = Instant::now();
        match self.l3.get(key).await {
            Ok(Some(entry)) => {
                self.metrics.tier(Tier::L3).record_hit(start.elapsed());
                self.promote(&entry, Tier::L2);
                Some(entry)
            }
            Ok(None) => {
                self.metrics.tier(Tier::L3).record_miss(start.elapsed());
                None
            }
            Err(_) => {
                let l3 = self.metrics.tier(Tier::L3);
                l3.record_backend_error();
                l3.record_miss(start.elapsed());
                None
            }
        }
    }

    /// Copy an entry into a faster in-memory tier
    ///
    /// Uses the remaining lifetime capped by the target tier's default TTL.
    /// Never fails the read.
    fn promote(&self, entry: &CacheEntry, target: Tier) {
        let Some(store) = self.store(target) else {
            return;
        };

        let now = self.clock.now_millis();
        let remaining = entry.remaining_ttl(now);
        if remaining == 0 {
            return;
        }
        let ttl = remaining.min(self.config.tier(target).default_ttl);

        let copy = if entry.is_compressed() && !self.config.tier(target).compression {
            match self.compressor.decompress(entry.payload()) {
                Ok(raw) => CacheEntry::new(entry.key(), raw, entry.size(), false, ttl, now)
                    .in_tier(target)
                    .with_metadata(entry.metadata().clone())
                    .with_tags(entry.tags().to_vec()),
                Err(e) => {
                    warn!(key = entry.key(), error = %e, "Skipping promotion of undecodable entry");
                    return;
                }
            }
        } else {
            entry.copy_for(target, ttl, now)
        };

        let evicted = store.set(copy);
        let counters = self.metrics.tier(target);
        counters.record_promotion();
        counters.record_evictions(evicted.len() as u64);

        debug!(key = entry.key(), from = %entry.tier(), to = %target, ttl, "Promoted entry");
    }

    fn decode(&self, entry: &CacheEntry) -> Result<V> {
        let raw = self.compressor.restore(entry.payload(), entry.is_compressed())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value
    ///
    /// The value goes to the resolved tier and, unless `promotion_only`, to
    /// every faster tier with TTL capped at that tier's default. Copies that
    /// would otherwise shadow or outlive the new value are removed.
    pub async fn set(&self, key: &str, value: &V, opts: SetOptions) -> Result<()> {
        let raw = Bytes::from(serde_json::to_vec(value)?);
        self.set_raw(key, raw, &opts).await
    }

    /// Store several values concurrently; the first error is returned
    pub async fn mset(&self, entries: Vec<Entry<V>>) -> Result<()> {
        let writes = entries
            .iter()
            .map(|entry| self.set(&entry.key, &entry.value, entry.options.clone()));

        futures::future::join_all(writes)
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()
            .map(|_| ())
    }

    /// Cache-aside lookup
    ///
    /// On a miss (or with `skip_cache`) the loader runs and its value is
    /// stored. Loader errors are returned as-is and nothing is cached. A
    /// failure to store the loaded value is logged, not returned.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        loader: F,
        opts: SetOptions,
    ) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        if !opts.skip_cache {
            if let Some(value) = self.get(key, &OperationContext::default()).await {
                return Ok(value);
            }
        }

        let value = loader().await?;
        if let Err(e) = self.set(key, &value, opts).await {
            warn!(key, error = %e, "Failed to cache loaded value");
        }
        Ok(value)
    }

    async fn set_raw(&self, key: &str, raw: Bytes, opts: &SetOptions) -> Result<()> {
        let size = raw.len() as u64;
        let tier = self.selector.select(key, size, opts.tier);
        let ttl = self
            .selector
            .resolve_ttl(key, opts.ttl, self.config.tier(tier).default_ttl)
            .min(MAX_TTL_SECS);
        if ttl == 0 {
            return Err(Error::Config(format!("ttl for {} must be positive", key)));
        }

        let now = self.clock.now_millis();
        let packed = self.compressor.maybe_compress(&raw);

        let entry = self.build_entry(key, tier, &raw, &packed, ttl, now, opts);
        self.write_tier(tier, entry).await;

        for &faster in tier.faster_tiers() {
            if opts.promotion_only {
                if let Some(store) = self.store(faster) {
                    store.delete(key);
                }
                continue;
            }
            let capped = ttl.min(self.config.tier(faster).default_ttl);
            let entry = self.build_entry(key, faster, &raw, &packed, capped, now, opts);
            self.write_tier(faster, entry).await;
        }

        for slower in Tier::ALL.into_iter().filter(|&t| t > tier) {
            self.delete_from(slower, key).await;
        }

        self.index.record_tags(key, &opts.tags);
        debug!(key, %tier, ttl, size, compressed = packed.1, "Stored entry");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_entry(
        &self,
        key: &str,
        tier: Tier,
        raw: &Bytes,
        packed: &(Bytes, bool),
        ttl: u64,
        now: i64,
        opts: &SetOptions,
    ) -> CacheEntry {
        let (payload, compressed) = if packed.1 && self.config.tier(tier).compression {
            self.metrics
                .tier(tier)
                .record_compression(raw.len() as u64, packed.0.len() as u64);
            (packed.0.clone(), true)
        } else {
            (raw.clone(), false)
        };

        CacheEntry::new(key, payload, raw.len() as u64, compressed, ttl, now)
            .in_tier(tier)
            .with_metadata(opts.metadata.clone())
            .with_tags(opts.tags.clone())
    }

    async fn write_tier(&self, tier: Tier, entry: CacheEntry) {
        let evicted = match self.store(tier) {
            Some(store) => store.set(entry),
            None => match self.l3.put(entry).await {
                Ok(evicted) => evicted,
                Err(_) => {
                    self.metrics.tier(Tier::L3).record_backend_error();
                    return;
                }
            },
        };
        self.metrics.tier(tier).record_evictions(evicted.len() as u64);
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Invalidate by pattern, tag or query
    ///
    /// Matched keys are removed from every tier, then the cascade rules are
    /// applied once to them. Returns the number of distinct keys removed from
    /// at least one tier.
    #[instrument(skip_all, fields(tenant = ctx.tenant.as_deref(), user = ctx.user.as_deref()))]
    pub async fn invalidate(
        &self,
        target: impl Into<Invalidation>,
        ctx: &OperationContext,
    ) -> Result<usize> {
        let target = target.into();
        target.validate()?;

        let present = self.present_keys().await;
        let initial = match &target {
            Invalidation::Pattern(pattern) => self.index.find_by_pattern(pattern, &present),
            Invalidation::Tag(tag) => self.index.keys_for_tag(tag).into_iter().collect(),
            Invalidation::Query(query) => {
                let infos = self.all_infos().await;
                self.index.find_by_query(query, &infos)
            }
        };
        let cascade = self.index.cascade_for(&initial, &present);

        let mut removed = BTreeSet::new();
        for key in initial.iter().chain(cascade.iter()) {
            if self.remove_everywhere(key).await {
                removed.insert(key.as_str());
            }
        }
        self.index
            .forget(initial.iter().chain(cascade.iter()).map(String::as_str));

        info!(
            target = ?target,
            matched = initial.len(),
            cascaded = cascade.len(),
            deleted = removed.len(),
            "Invalidated cache entries"
        );
        Ok(removed.len())
    }

    /// Remove one key from every tier
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.remove_everywhere(key).await;
        self.index.forget([key]);
        removed
    }

    async fn remove_everywhere(&self, key: &str) -> bool {
        let mut removed = false;
        for tier in Tier::ALL {
            removed |= self.delete_from(tier, key).await;
        }
        removed
    }

    async fn delete_from(&self, tier: Tier, key: &str) -> bool {
        match self.store(tier) {
            Some(store) => store.delete(key),
            None => match self.l3.delete(key).await {
                Ok(removed) => removed,
                Err(e) => {
                    self.metrics.tier(Tier::L3).record_backend_error();
                    warn!(key, %tier, error = %e, "Backend delete failed; stale copy may remain");
                    false
                }
            },
        }
    }

    /// Union of live keys across tiers
    async fn present_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self.l1.keys().into_iter().collect();
        keys.extend(self.l2.keys());
        match self.l3.keys().await {
            Ok(l3) => keys.extend(l3),
            Err(_) => self.metrics.tier(Tier::L3).record_backend_error(),
        }
        keys
    }

    /// Metadata of every live copy in every tier
    async fn all_infos(&self) -> Vec<EntryInfo> {
        let mut infos = self.l1.infos();
        infos.extend(self.l2.infos());
        match self.l3.infos().await {
            Ok(l3) => infos.extend(l3),
            Err(_) => self.metrics.tier(Tier::L3).record_backend_error(),
        }
        infos
    }

    // =========================================================================
    // Metrics & Health
    // =========================================================================

    /// Metrics for one tier, with gauges refreshed
    pub async fn metrics(&self, tier: Tier) -> TierMetrics {
        self.refresh_gauges(tier).await;
        self.metrics.snapshot(tier)
    }

    /// Metrics for all tiers, with gauges refreshed
    pub async fn all_metrics(&self) -> BTreeMap<Tier, TierMetrics> {
        for tier in Tier::ALL {
            self.refresh_gauges(tier).await;
        }
        self.metrics.snapshot_all()
    }

    /// Evaluate health against the configured thresholds
    pub async fn health_check(&self) -> HealthReport {
        let metrics = self.all_metrics().await;
        HealthReport::evaluate(&metrics, self.l3.is_available(), &self.config.health)
    }

    /// False after a failed L3 call, until the next successful one
    pub fn l3_available(&self) -> bool {
        self.l3.is_available()
    }

    /// L3 backend operation counters
    pub fn l3_backend(&self) -> &Arc<dyn L3Backend> {
        self.l3.backend()
    }

    /// Receive health alerts raised by the monitor
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub(crate) fn alert_sender(&self) -> &broadcast::Sender<Alert> {
        &self.alerts
    }

    async fn refresh_gauges(&self, tier: Tier) {
        let counters = self.metrics.tier(tier);
        match self.store(tier) {
            Some(store) => counters.update_gauges(store.len() as u64, store.memory_usage()),
            None => {
                let len = self.l3.len().await;
                let usage = self.l3.memory_usage().await;
                match (len, usage) {
                    (Ok(len), Ok(usage)) => counters.update_gauges(len as u64, usage),
                    _ => counters.record_backend_error(),
                }
            }
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Drop expired entries from one tier; returns the number removed
    pub async fn purge_expired(&self, tier: Tier) -> usize {
        match self.store(tier) {
            Some(store) => store.purge_expired(),
            None => match self.l3.purge_expired().await {
                Ok(purged) => purged,
                Err(_) => {
                    self.metrics.tier(Tier::L3).record_backend_error();
                    0
                }
            },
        }
    }

    /// Drop tag records of keys no longer stored in any tier
    pub async fn prune_tags(&self) -> usize {
        if !self.l3.is_available() {
            // A partial key set would prune live L3 keys
            return 0;
        }
        let present = self.present_keys().await;
        // Recheck each candidate: a concurrent set may have landed after the snapshot
        let mut gone = BTreeSet::new();
        for key in self.index.tagged_keys() {
            if !present.contains(&key) && !self.is_stored(&key).await {
                gone.insert(key);
            }
        }
        if gone.is_empty() {
            return 0;
        }
        self.index.prune(|key| !gone.contains(key))
    }

    /// Live copy in any tier; an L3 error counts as present
    async fn is_stored(&self, key: &str) -> bool {
        if self.l1.contains(key) || self.l2.contains(key) {
            return true;
        }
        !matches!(self.l3.peek(key).await, Ok(None))
    }

    fn store(&self, tier: Tier) -> Option<&EntryStore> {
        match tier {
            Tier::L1 => Some(&self.l1),
            Tier::L2 => Some(&self.l2),
            Tier::L3 => None,
        }
    }
}

impl<V> std::fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("l1", &self.l1)
            .field("l2", &self.l2)
            .field("l3_backend", &self.l3.backend().name())
            .field("l3_available", &self.l3.is_available())
            .finish()
    }
}

/// Open the configured L3 backend
pub async fn open_backend(
    config: &CacheConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn L3Backend>> {
    let backend: Arc<dyn L3Backend> = match &config.l3_backend {
        L3BackendConfig::Memory => Arc::new(InMemoryL3Backend::new(&config.l3, clock)),
        L3BackendConfig::Disk { path } => {
            Arc::new(DiskL3Backend::open(path.clone(), &config.l3, clock).await?)
        }
    };
    Ok(backend)
}

// =============================================================================
// Tests
// =============================================================================
