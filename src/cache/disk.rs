//! Disk Backend - Durable L3 Storage
//!
//! One file per entry under a root directory. The in-memory index is rebuilt
//! from the file headers on open, so L3 survives restarts.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────┬────────────────────────┬─────────────────────┐
//! │ header len (u32) │ EntryInfo (JSON)       │ payload (raw bytes) │
//! │ little endian    │                        │ compressed or not   │
//! └──────────────────┴────────────────────────┴─────────────────────┘
//! ```
//!
//! File names are the hex-encoded key, split into 128-character directory
//! segments so long keys stay under filesystem name limits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::entry::{CacheEntry, EntryInfo};
use super::l3::{BackendOps, L3Backend, L3BackendStats};
use super::policy::{EvictionPolicy, Tier};
use crate::config::TierConfig;
use crate::error::{Error, Result};

const ENTRY_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";
const SEGMENT_LEN: usize = 128;
const HEADER_LEN_BYTES: usize = 4;

/// Durable L3 backend on the local filesystem
pub struct DiskL3Backend {
    root: PathBuf,
    /// Live entry metadata; access bookkeeping is kept here, not on disk
    index: DashMap<String, EntryInfo>,
    max_keys: usize,
    eviction: EvictionPolicy,
    clock: Arc<dyn Clock>,
    /// Serializes writers so the key cap holds
    write_gate: tokio::sync::Mutex<()>,
    ops: BackendOps,
}

impl DiskL3Backend {
    /// Open (or create) a store under `root` and rebuild its index
    pub async fn open(
        root: impl Into<PathBuf>,
        config: &TierConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let backend = Self {
            root,
            index: DashMap::new(),
            max_keys: config.max_keys.max(1),
            eviction: config.eviction,
            clock,
            write_gate: tokio::sync::Mutex::new(()),
            ops: BackendOps::default(),
        };
        backend.rebuild_index().await?;

        info!(
            root = %backend.root.display(),
            entries = backend.index.len(),
            "Opened disk L3 backend"
        );
        Ok(backend)
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let encoded = hex::encode(key.as_bytes());
        let mut path = self.root.clone();
        let mut segments = encoded.as_bytes().chunks(SEGMENT_LEN).peekable();

        // An empty key still needs a file name
        if segments.peek().is_none() {
            return path.join(format!("_.{}", ENTRY_EXTENSION));
        }

        while let Some(segment) = segments.next() {
            // Hex digits are ASCII
            let segment = String::from_utf8_lossy(segment);
            if segments.peek().is_some() {
                path.push(segment.as_ref());
            } else {
                path.push(format!("{}.{}", segment, ENTRY_EXTENSION));
            }
        }
        path
    }

    async fn rebuild_index(&self) -> Result<()> {
        let now = self.clock.now_millis();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                match path.extension().and_then(|e| e.to_str()) {
                    Some(ENTRY_EXTENSION) => {}
                    Some(TEMP_EXTENSION) => {
                        // Interrupted write
                        remove_file(&path).await?;
                        continue;
                    }
                    _ => continue,
                }

                match read_entry(&path).await {
                    Ok((info, _)) if info.is_expired(now) => remove_file(&path).await?,
                    Ok((info, _)) => {
                        self.index.insert(info.key.clone(), info);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Dropping unreadable cache file");
                        remove_file(&path).await?;
                    }
                }
            }
        }

        Ok(())
    }

    fn lookup(&self, key: &str) -> Option<EntryInfo> {
        self.index.get(key).map(|info| info.clone())
    }

    /// Pick the next key to evict: an expired one if any, else by policy
    fn pick_victim(&self) -> Option<String> {
        let now = self.clock.now_millis();

        if let Some(expired) = self
            .index
            .iter()
            .find(|item| item.value().is_expired(now))
            .map(|item| item.key().clone())
        {
            return Some(expired);
        }

        self.index
            .iter()
            .min_by_key(|item| {
                let info = item.value();
                self.eviction.rank(info.last_accessed, info.access_count)
            })
            .map(|item| item.key().clone())
    }

    async fn remove_key(&self, key: &str) -> Result<bool> {
        let present = self.index.remove(key).is_some();
        remove_file(&self.entry_path(key)).await?;
        Ok(present)
    }

    async fn write_entry(&self, info: &EntryInfo, payload: &[u8]) -> Result<()> {
        let path = self.entry_path(&info.key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = path.with_extension(TEMP_EXTENSION);
        tokio::fs::write(&temp, encode(info, payload)?).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl L3Backend for DiskL3Backend {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
        self.ops.read();
        let now = self.clock.now_millis();

        let Some(info) = self.lookup(key) else {
            return Ok(None);
        };
        if info.is_expired(now) {
            self.remove_key(key).await?;
            return Ok(None);
        }

        let (mut stored, payload) = match read_entry(&self.entry_path(key)).await {
            Ok(found) => found,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted underneath us
                self.index.remove(key);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if stored.key != key {
            return Err(Error::CorruptEntry(format!(
                "file for {} holds key {}",
                key, stored.key
            )));
        }

        if let Some(mut slot) = self.index.get_mut(key) {
            slot.last_accessed = now;
            slot.access_count += 1;
            stored.last_accessed = slot.last_accessed;
            stored.access_count = slot.access_count;
        }

        Ok(Some(Arc::new(CacheEntry::from_info(stored, payload))))
    }

    async fn peek(&self, key: &str) -> Result<Option<Arc<CacheEntry>>> {
        let now = self.clock.now_millis();
        match self.lookup(key) {
            Some(info) if !info.is_expired(now) => {
                let (_, payload) = read_entry(&self.entry_path(key)).await?;
                Ok(Some(Arc::new(CacheEntry::from_info(info, payload))))
            }
            _ => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<Vec<String>> {
        self.ops.write();
        let _gate = self.write_gate.lock().await;

        let entry = entry.in_tier(Tier::L3);
        let key = entry.key().to_string();
        let mut evicted = Vec::new();

        if !self.index.contains_key(&key) {
            while self.index.len() >= self.max_keys {
                let Some(victim) = self.pick_victim() else {
                    break;
                };
                self.remove_key(&victim).await?;
                evicted.push(victim);
            }
        }

        let info = entry.info();
        self.write_entry(&info, entry.payload()).await?;
        self.index.insert(key, info);

        if !evicted.is_empty() {
            debug!(keys = ?evicted, "Evicted disk entries");
        }
        Ok(evicted)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ops.delete();
        let _gate = self.write_gate.lock().await;
        self.remove_key(key).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let now = self.clock.now_millis();
        Ok(self
            .index
            .iter()
            .filter(|item| !item.value().is_expired(now))
            .map(|item| item.key().clone())
            .collect())
    }

    async fn infos(&self) -> Result<Vec<EntryInfo>> {
        let now = self.clock.now_millis();
        Ok(self
            .index
            .iter()
            .filter(|item| !item.value().is_expired(now))
            .map(|item| item.value().clone())
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.index.len())
    }

    async fn memory_usage(&self) -> Result<u64> {
        Ok(self.index.iter().map(|item| item.value().stored_size).sum())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|item| item.value().is_expired(now))
            .map(|item| item.key().clone())
            .collect();

        let _gate = self.write_gate.lock().await;
        let mut purged = 0;
        for key in expired {
            if self.remove_key(&key).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn stats(&self) -> L3BackendStats {
        self.ops.snapshot()
    }
}

// =============================================================================
// Encoding
// =============================================================================

fn encode(info: &EntryInfo, payload: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(info)?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| Error::CorruptEntry(format!("header too large for {}", info.key)))?;

    let mut buf = Vec::with_capacity(HEADER_LEN_BYTES + header.len() + payload.len());
    buf.extend_from_slice(&header_len.to_le_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn decode(bytes: Vec<u8>) -> Result<(EntryInfo, Bytes)> {
    if bytes.len() < HEADER_LEN_BYTES {
        return Err(Error::CorruptEntry("truncated header length".into()));
    }
    let mut len_bytes = [0u8; HEADER_LEN_BYTES];
    len_bytes.copy_from_slice(&bytes[..HEADER_LEN_BYTES]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_end = HEADER_LEN_BYTES
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::CorruptEntry("truncated header".into()))?;

    let info: EntryInfo = serde_json::from_slice(&bytes[HEADER_LEN_BYTES..header_end])
        .map_err(|e| Error::CorruptEntry(format!("bad header: {}", e)))?;

    let payload = Bytes::from(bytes).slice(header_end..);
    if payload.len() as u64 != info.stored_size {
        return Err(Error::CorruptEntry(format!(
            "{}: expected {} payload bytes, found {}",
            info.key,
            info.stored_size,
            payload.len()
        )));
    }
    Ok((info, payload))
}

async fn read_entry(path: &Path) -> Result<(EntryInfo, Bytes)> {
    let bytes = tokio::fs::read(path).await?;
    decode(bytes)
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Tests
// =============================================================================
