//! Durable key-value persistence
//!
//! Holds the managed key list and the default recipient. Values are JSON;
//! a `null` value reads back as absent.

use crate::errors::{CipherpadError, Result};
use crate::fsutil;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Durable settings storage provided by the host
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Whole-file JSON object on disk, rewritten atomically on each `set`
pub struct JsonFileStateStore {
    path: PathBuf,
    cache: Mutex<Option<Map<String, Value>>>,
}

impl JsonFileStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<Map<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => match serde_json::from_slice(&bytes)? {
                Value::Object(map) => Ok(map),
                _ => Err(CipherpadError::StorageError(format!(
                    "State file {:?} is not a JSON object",
                    self.path
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {:?}, starting empty", self.path);
                Ok(Map::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        Ok(cache
            .as_ref()
            .and_then(|map| map.get(key))
            .filter(|value| !value.is_null())
            .cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        // Held across the write so concurrent sets land in order
        let mut cache = self.cache.lock().await;
        let mut map = match cache.as_ref() {
            Some(map) => map.clone(),
            None => self.load().await?,
        };

        if value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), value);
        }

        // The cache only ever mirrors what reached the disk
        let bytes = serde_json::to_vec_pretty(&map)?;
        fsutil::write_atomic(self.path.clone(), bytes).await?;
        *cache = Some(map);
        Ok(())
    }
}

/// In-memory state, lost on drop
#[derive(Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.lock().await;
        if value.is_null() {
            values.remove(key);
        } else {
            values.insert(key.to_string(), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = JsonFileStateStore::new(&path);
            assert_eq!(store.get("defaultRecipient").await.unwrap(), None);
            store.set("defaultRecipient", json!("ABCD")).await.unwrap();
            store.set("keys", json!([{"keyId": "ABCD"}])).await.unwrap();
        }

        // Reopen (simulating restart)
        let store = JsonFileStateStore::new(&path);
        assert_eq!(
            store.get("defaultRecipient").await.unwrap(),
            Some(json!("ABCD"))
        );
        assert_eq!(
            store.get("keys").await.unwrap(),
            Some(json!([{"keyId": "ABCD"}]))
        );
    }

    #[tokio::test]
    async fn test_null_clears_value() {
        let dir = tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("state.json"));

        store.set("defaultRecipient", json!("ABCD")).await.unwrap();
        store.set("defaultRecipient", Value::Null).await.unwrap();
        assert_eq!(store.get("defaultRecipient").await.unwrap(), None);

        let memory = MemoryStateStore::new();
        memory.set("k", json!(1)).await.unwrap();
        memory.set("k", Value::Null).await.unwrap();
        assert_eq!(memory.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cached_state_alone() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("state");
        let store = JsonFileStateStore::new(parent.join("state.json"));
        store.set("keys", json!(["kept"])).await.unwrap();

        // A plain file where the parent directory should be
        std::fs::remove_dir_all(&parent).unwrap();
        std::fs::write(&parent, b"not a directory").unwrap();

        assert!(store.set("keys", json!(["ghost"])).await.is_err());
        assert_eq!(store.get("keys").await.unwrap(), Some(json!(["kept"])));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"[1, 2, 3]").unwrap();

        let store = JsonFileStateStore::new(&path);
        assert!(matches!(
            store.get("keys").await,
            Err(CipherpadError::StorageError(_))
        ));
    }
}
