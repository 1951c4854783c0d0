//! Cache Entry Types
//!
//! An entry is immutable apart from its access bookkeeping, which uses atomics
//! so readers holding only a shard read lock can record hits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::policy::Tier;

/// TTL in milliseconds, saturating at `i64::MAX`
#[inline]
fn ttl_millis(ttl: u64) -> i64 {
    i64::try_from(ttl).unwrap_or(i64::MAX).saturating_mul(1000)
}

/// Serializable snapshot of an entry's metadata
///
/// Used for structured invalidation queries and as the on-disk header of the
/// durable L3 backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// Cache key
    pub key: String,
    /// Tier owning this copy
    pub tier: Tier,
    /// Time to live in seconds
    pub ttl: u64,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    /// Last access timestamp (epoch millis)
    pub last_accessed: i64,
    /// Number of reads
    pub access_count: u64,
    /// Serialized size before compression
    pub size: u64,
    /// Size of the stored payload
    pub stored_size: u64,
    /// Payload is LZ4 compressed
    pub compressed: bool,
    /// Free-form attributes (e.g. tenant)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Invalidation tags
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EntryInfo {
    /// Check expiry against the given time
    pub fn is_expired(&self, now: i64) -> bool {
        now.saturating_sub(self.created_at) > ttl_millis(self.ttl)
    }

    /// Tenant attribute, if any
    pub fn tenant(&self) -> Option<&str> {
        self.metadata.get("tenant").map(String::as_str)
    }
}

/// Cached value plus metadata
pub struct CacheEntry {
    key: String,
    tier: Tier,
    ttl: u64,
    created_at: i64,
    size: u64,
    compressed: bool,
    metadata: HashMap<String, String>,
    tags: Vec<String>,
    last_accessed: AtomicI64,
    access_count: AtomicU64,
    payload: Bytes,
}

impl CacheEntry {
    /// Create a new entry
    ///
    /// `size` is the serialized length before compression; `payload` is what
    /// is actually stored.
    pub fn new(
        key: impl Into<String>,
        payload: Bytes,
        size: u64,
        compressed: bool,
        ttl: u64,
        created_at: i64,
    ) -> Self {
        Self {
            key: key.into(),
            tier: Tier::L1,
            ttl,
            created_at,
            size,
            compressed,
            metadata: HashMap::new(),
            tags: Vec::new(),
            last_accessed: AtomicI64::new(created_at),
            access_count: AtomicU64::new(0),
            payload,
        }
    }

    /// Rebuild an entry from a stored header and payload
    pub fn from_info(info: EntryInfo, payload: Bytes) -> Self {
        Self {
            key: info.key,
            tier: info.tier,
            ttl: info.ttl,
            created_at: info.created_at,
            size: info.size,
            compressed: info.compressed,
            metadata: info.metadata,
            tags: info.tags,
            last_accessed: AtomicI64::new(info.last_accessed),
            access_count: AtomicU64::new(info.access_count),
            payload,
        }
    }

    /// Set the owning tier
    pub fn in_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Attach metadata attributes
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach invalidation tags
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Copy this entry into another tier with a fresh lifetime
    ///
    /// The payload is shared, not copied.
    pub fn copy_for(&self, tier: Tier, ttl: u64, now: i64) -> Self {
        Self {
            key: self.key.clone(),
            tier,
            ttl,
            created_at: now,
            size: self.size,
            compressed: self.compressed,
            metadata: self.metadata.clone(),
            tags: self.tags.clone(),
            last_accessed: AtomicI64::new(now),
            access_count: AtomicU64::new(0),
            payload: self.payload.clone(),
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    #[inline]
    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    #[inline]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Serialized size before compression
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Stored payload size
    #[inline]
    pub fn stored_size(&self) -> u64 {
        self.payload.len() as u64
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Absolute expiry time (epoch millis)
    #[inline]
    pub fn expires_at(&self) -> i64 {
        self.created_at.saturating_add(ttl_millis(self.ttl))
    }

    /// Expired iff `now - created_at > ttl * 1000`
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at()
    }

    /// Whole seconds of lifetime left
    pub fn remaining_ttl(&self, now: i64) -> u64 {
        (self.expires_at().saturating_sub(now).max(0) / 1000) as u64
    }

    /// Record a read and return the new access count
    #[inline]
    pub fn record_access(&self, now: i64) -> u64 {
        self.last_accessed.store(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_accessed(&self) -> i64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    /// Snapshot metadata
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            key: self.key.clone(),
            tier: self.tier,
            ttl: self.ttl,
            created_at: self.created_at,
            last_accessed: self.last_accessed(),
            access_count: self.access_count(),
            size: self.size,
            stored_size: self.stored_size(),
            compressed: self.compressed,
            metadata: self.metadata.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("tier", &self.tier)
            .field("size", &self.size)
            .field("compressed", &self.compressed)
            .field("access_count", &self.access_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
