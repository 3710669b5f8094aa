//! Durable key-value persistence for alarm and intent records.
//!
//! Values are JSON documents. `write_batch` applies a group of puts and
//! deletes atomically: either every operation lands or none does.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Transient,
            Self::Serialization(_) | Self::Unavailable(_) => ErrorKind::FatalConfiguration,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone)]
pub enum WriteOp {
    Put { key: String, value: Value },
    Delete { key: String },
}

impl WriteOp {
    pub fn put(key: impl Into<String>, value: Value) -> Self {
        Self::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Apply every operation atomically.
    async fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()>;

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.write_batch(vec![WriteOp::put(key, value)]).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.write_batch(vec![WriteOp::delete(key)]).await
    }

    fn backend_type(&self) -> &str;
}

fn apply(map: &mut BTreeMap<String, Value>, ops: Vec<WriteOp>) {
    for op in ops {
        match op {
            WriteOp::Put { key, value } => {
                map.insert(key, value);
            }
            WriteOp::Delete { key } => {
                map.remove(&key);
            }
        }
    }
}

fn list_prefix(map: &BTreeMap<String, Value>, prefix: &str) -> Vec<(String, Value)> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// In-process store, used for tests and `storage.backend: memory`.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.lock().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        Ok(list_prefix(&*self.map.lock().await, prefix))
    }

    async fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        apply(&mut *self.map.lock().await, ops);
        Ok(())
    }

    fn backend_type(&self) -> &str {
        "memory"
    }
}

/// Single JSON document on disk. Every batch rewrites the document through
/// a temp file and an atomic rename, so a crash never leaves a half-written
/// batch behind.
pub struct JsonFileStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        fs::create_dir_all(&parent).await.map_err(|e| {
            StorageError::Unavailable(format!("cannot create {}: {e}", parent.display()))
        })?;

        let map = match fs::read(&path).await {
            Ok(data) if data.is_empty() => BTreeMap::new(),
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No store at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Opened store {} ({} keys)", path.display(), map.len());
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    async fn persist(&self, map: &BTreeMap<String, Value>) -> Result<()> {
        let data = serde_json::to_vec_pretty(map)?;
        let temp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            warn!("Failed to commit store {}: {e}", self.path.display());
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.lock().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        Ok(list_prefix(&*self.map.lock().await, prefix))
    }

    async fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut guard = self.map.lock().await;
        let mut next = guard.clone();
        apply(&mut next, ops);
        // The in-memory view only moves once the file has been replaced.
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    fn backend_type(&self) -> &str {
        "json-file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn memory_store_lists_by_prefix() {
        let store = MemoryStore::new();
        store.put("alarm/1", json!({"a": 1})).await.unwrap();
        store.put("alarm/2", json!({"a": 2})).await.unwrap();
        store.put("intent/1", json!({"i": 1})).await.unwrap();

        let alarms = store.list("alarm/").await.unwrap();
        assert_eq!(alarms.len(), 2);
        assert_eq!(alarms[0].0, "alarm/1");

        store.delete("alarm/1").await.unwrap();
        assert!(store.get("alarm/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.json");

        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store
                .write_batch(vec![
                    WriteOp::put("alarm/1", json!({"label": "one"})),
                    WriteOp::put("alarm/2", json!({"label": "two"})),
                ])
                .await
                .unwrap();
            store.delete("alarm/2").await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("alarm/1").await.unwrap(),
            Some(json!({"label": "one"}))
        );
        assert!(reopened.get("alarm/2").await.unwrap().is_none());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = JsonFileStore::open(&path).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::FatalConfiguration);
    }
}
