//! Disk-backed audio cache with a bounded memory tier.
//!
//! Layout under the cache root:
//!
//! ```text
//! index.json          entry metadata (key, size, timestamps, expiry)
//! blobs/<key>.bin     payload bytes
//! ```
//!
//! Locking is per key. Maintenance only ever `try_lock`s entries, so it
//! skips anything a writer is busy with instead of waiting on it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache as MokaCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_128;

use super::health::{CacheMetrics, HealthReport, HealthThresholds};
use crate::clock::SharedClock;
use crate::error::ErrorKind;

const BLOB_EXT: &str = ".bin";
const TEMP_EXT: &str = ".tmp";
const MAX_KEY_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    #[error("Cache full: need {needed} bytes, cap is {max} bytes")]
    Full { needed: u64, max: u64 },
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Transient,
            Self::InvalidKey(_) => ErrorKind::FatalConfiguration,
            Self::Full { .. } => ErrorKind::ResourceExhausted,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Key for a payload owned by `owner`, addressed by its content.
pub fn content_key(owner: &str, payload: &[u8]) -> String {
    format!("{owner}-{:032x}", xxh3_128(payload))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Audio,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub kind: PayloadKind,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_bytes: u64,
    pub default_ttl: chrono::Duration,
    pub memory_bytes: u64,
    pub thresholds: HealthThresholds,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub evicted: usize,
    pub orphan_files: usize,
    pub dangling_entries: usize,
    pub total_bytes: u64,
    pub entry_count: usize,
}

pub struct AudioCache {
    blobs: PathBuf,
    index_path: PathBuf,
    limits: CacheLimits,
    memory: MokaCache<String, Bytes>,
    index: RwLock<HashMap<String, CacheEntry>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    index_writer: Mutex<()>,
    maintenance: Mutex<()>,
    metrics: CacheMetrics,
    clock: SharedClock,
}

impl AudioCache {
    pub async fn open(root: impl AsRef<Path>, limits: CacheLimits, clock: SharedClock) -> Result<Self> {
        let root = root.as_ref();
        let blobs = root.join("blobs");
        let index_path = root.join("index.json");
        fs::create_dir_all(&blobs).await?;

        let index = match fs::read(&index_path).await {
            Ok(data) => match serde_json::from_slice::<Vec<CacheEntry>>(&data) {
                Ok(entries) => entries.into_iter().map(|e| (e.key.clone(), e)).collect(),
                Err(e) => {
                    // Maintenance will reclaim the payload files as orphans.
                    warn!("Discarding unreadable cache index {}: {e}", index_path.display());
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let memory = MokaCache::builder()
            .weigher(|_key: &String, value: &Bytes| u32::try_from(value.len()).unwrap_or(u32::MAX))
            .max_capacity(limits.memory_bytes)
            .build();

        info!(
            "Audio cache at {} ({} entries, cap {} bytes)",
            root.display(),
            index.len(),
            limits.max_bytes
        );

        Ok(Self {
            blobs,
            index_path,
            limits,
            memory,
            index: RwLock::new(index),
            locks: DashMap::new(),
            index_writer: Mutex::new(()),
            maintenance: Mutex::new(()),
            metrics: CacheMetrics::default(),
            clock,
        })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.blobs.join(format!("{key}{BLOB_EXT}"))
    }

    fn validate_key(key: &str) -> Result<()> {
        let valid = !key.is_empty()
            && key.len() <= MAX_KEY_LEN
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(CacheError::InvalidKey(key.to_string()))
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().value().clone()
    }

    fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(key).try_lock_owned().ok()
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.read().values().map(|e| e.size).sum()
    }

    pub fn entry_count(&self) -> usize {
        self.index.read().len()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.index.read().values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn max_bytes(&self) -> u64 {
        self.limits.max_bytes
    }

    fn fits(&self, key: &str, size: u64) -> bool {
        let index = self.index.read();
        let existing = index.get(key).map_or(0, |e| e.size);
        let total: u64 = index.values().map(|e| e.size).sum();
        total - existing + size <= self.limits.max_bytes
    }

    /// Store a payload. A full cache triggers maintenance and one retry
    /// before giving up with [`CacheError::Full`].
    pub async fn put(
        &self,
        key: &str,
        payload: Bytes,
        kind: PayloadKind,
        ttl: Option<chrono::Duration>,
    ) -> Result<CacheEntry> {
        Self::validate_key(key)?;
        let size = payload.len() as u64;
        let full = CacheError::Full {
            needed: size,
            max: self.limits.max_bytes,
        };
        if size > self.limits.max_bytes {
            return Err(full);
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        if !self.fits(key, size) {
            info!("Cache full, running maintenance before writing {key}");
            self.maintain(self.limits.max_bytes - size).await?;
            if !self.fits(key, size) {
                return Err(full);
            }
        }

        write_atomic(&self.blob_path(key), &payload).await?;

        let now = self.clock.now();
        let entry = CacheEntry {
            key: key.to_string(),
            kind,
            size,
            created_at: now,
            last_accessed_at: now,
            expires_at: now + ttl.unwrap_or(self.limits.default_ttl),
        };
        self.index.write().insert(key.to_string(), entry.clone());
        self.memory.insert(key.to_string(), payload).await;
        self.metrics.record_write();
        self.persist_index().await?;

        debug!("Cached {key} ({size} bytes, {:?})", kind);
        Ok(entry)
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<chrono::Duration>,
    ) -> Result<CacheEntry> {
        let data = serde_json::to_vec(value)?;
        self.put(key, Bytes::from(data), PayloadKind::Metadata, ttl).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let entry = { self.index.read().get(key).cloned() };
        let Some(entry) = entry else {
            self.metrics.record_miss();
            return Ok(None);
        };

        let now = self.clock.now();
        if entry.expires_at <= now {
            let lock = self.lock_for(key);
            let _guard = lock.lock().await;
            self.remove_entry(key).await?;
            self.persist_index().await?;
            debug!("Cache entry {key} expired");
            self.metrics.record_miss();
            return Ok(None);
        }

        if let Some(bytes) = self.memory.get(key).await {
            self.touch(key, now);
            self.metrics.record_hit();
            return Ok(Some(bytes));
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        match fs::read(self.blob_path(key)).await {
            Ok(data) => {
                let bytes = Bytes::from(data);
                self.memory.insert(key.to_string(), bytes.clone()).await;
                self.touch(key, now);
                self.metrics.record_hit();
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Cache entry {key} lost its payload file, dropping it");
                self.index.write().remove(key);
                self.persist_index().await?;
                self.metrics.record_miss();
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Presence check that leaves hit/miss statistics and recency alone.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        let live = self
            .index
            .read()
            .get(key)
            .is_some_and(|e| e.expires_at > now);
        live && self.blob_path(key).exists()
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let existed = self.remove_entry(key).await?;
        if existed {
            self.persist_index().await?;
            debug!("Invalidated cache entry {key}");
        }
        Ok(existed)
    }

    /// Expire past-TTL entries, evict least-recently-used entries down to
    /// the size cap, and repair index/file drift in both directions.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.maintain(self.limits.max_bytes).await
    }

    pub fn health(&self) -> HealthReport {
        let (total, count) = {
            let index = self.index.read();
            (index.values().map(|e| e.size).sum(), index.len())
        };
        HealthReport::classify(
            &self.metrics,
            total,
            self.limits.max_bytes,
            count,
            self.limits.thresholds,
        )
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    async fn maintain(&self, target_bytes: u64) -> Result<MaintenanceReport> {
        let _maintenance = self.maintenance.lock().await;
        let now = self.clock.now();
        let mut report = MaintenanceReport::default();

        // Payload files currently on disk, plus stale temp files.
        let mut on_disk = HashSet::new();
        let mut temp_files = Vec::new();
        let mut dir = fs::read_dir(&self.blobs).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = name.strip_suffix(BLOB_EXT) {
                on_disk.insert(key.to_string());
            } else if let Some(key) = name
                .strip_suffix(TEMP_EXT)
                .and_then(|n| n.strip_suffix(BLOB_EXT))
            {
                temp_files.push((key.to_string(), entry.path()));
            } else {
                temp_files.push((name.clone(), entry.path()));
            }
        }

        let indexed: HashSet<String> = self.index.read().keys().cloned().collect();

        for key in on_disk.difference(&indexed) {
            if let Some(_guard) = self.try_lock(key) {
                remove_file_if_exists(&self.blob_path(key)).await?;
                report.orphan_files += 1;
            }
        }
        for (key, path) in temp_files {
            if let Some(_guard) = self.try_lock(&key) {
                remove_file_if_exists(&path).await?;
                report.orphan_files += 1;
            }
        }

        for key in indexed.difference(&on_disk) {
            if let Some(_guard) = self.try_lock(key) {
                self.index.write().remove(key);
                self.memory.invalidate(key).await;
                report.dangling_entries += 1;
            }
        }

        let expired: Vec<String> = self
            .index
            .read()
            .values()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key.clone())
            .collect();
        for key in expired {
            if let Some(_guard) = self.try_lock(&key) {
                self.remove_entry(&key).await?;
                report.expired += 1;
            }
        }

        let mut candidates: Vec<(DateTime<Utc>, String, u64)> = self
            .index
            .read()
            .values()
            .map(|e| (e.last_accessed_at, e.key.clone(), e.size))
            .collect();
        candidates.sort();

        let mut total = self.total_bytes();
        for (_, key, size) in candidates {
            if total <= target_bytes {
                break;
            }
            if let Some(_guard) = self.try_lock(&key) {
                self.remove_entry(&key).await?;
                total = total.saturating_sub(size);
                report.evicted += 1;
            }
        }

        self.metrics
            .record_evictions((report.expired + report.evicted) as u64);
        self.persist_index().await?;

        report.total_bytes = self.total_bytes();
        report.entry_count = self.entry_count();
        if report.expired + report.evicted + report.orphan_files + report.dangling_entries > 0 {
            info!(
                "Cache maintenance: expired={} evicted={} orphans={} dangling={} total={}B",
                report.expired,
                report.evicted,
                report.orphan_files,
                report.dangling_entries,
                report.total_bytes
            );
        }
        Ok(report)
    }

    fn touch(&self, key: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.index.write().get_mut(key) {
            entry.last_accessed_at = now;
        }
    }

    /// Caller holds the entry lock.
    async fn remove_entry(&self, key: &str) -> Result<bool> {
        let existed = self.index.write().remove(key).is_some();
        self.memory.invalidate(key).await;
        remove_file_if_exists(&self.blob_path(key)).await?;
        Ok(existed)
    }

    async fn persist_index(&self) -> Result<()> {
        let _writer = self.index_writer.lock().await;
        let snapshot = {
            let index = self.index.read();
            let mut entries: Vec<CacheEntry> = index.values().cloned().collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            entries
        };
        let data = serde_json::to_vec(&snapshot)?;
        write_atomic(&self.index_path, &data).await
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_EXT);
    let temp_path = PathBuf::from(temp);

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
