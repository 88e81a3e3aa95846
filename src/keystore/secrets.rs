//! Secret storage for remembered passphrases
//!
//! Entries are addressed by a namespaced id per key (see
//! [`passphrase_entry_id`]). Any failure of the backing store surfaces as
//! `SecretStoreUnavailable` so callers can degrade instead of aborting.

use crate::crypto::kdf::{KdfParams, SealedSecret};
use crate::errors::{CipherpadError, Result};
use crate::fsutil;
use crate::security::SecureString;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Namespace prefix of passphrase entries
pub const PASSPHRASE_NAMESPACE: &str = "cipherpad.passphrase.";

/// Secret store id holding the passphrase of `key_id`
pub fn passphrase_entry_id(key_id: &str) -> String {
    format!("{}{}", PASSPHRASE_NAMESPACE, key_id)
}

/// Secret storage provided by the host
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<SecureString>>;
    async fn set(&self, id: &str, value: &SecureString) -> Result<()>;
    /// Delete an entry; deleting a missing entry is not an error
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Process-local secret store
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, SecureString>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, id: &str) -> Result<Option<SecureString>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn set(&self, id: &str, value: &SecureString) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(id.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.entries.write().await.remove(id);
        Ok(())
    }
}

/// On-disk format of one secret entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecretFile {
    /// Version of the encryption format
    pub version: u32,

    /// Entry identifier
    pub id: String,

    /// Passphrase sealed under the master password
    pub sealed: SealedSecret,

    /// Creation timestamp
    pub created_at: i64,
}

/// Secret store keeping one encrypted JSON file per entry. Each entry is
/// sealed under a master password with its own salt and nonce.
pub struct EncryptedSecretStore {
    base_path: PathBuf,
    master_password: Option<SecretString>,
    kdf: KdfParams,
}

impl EncryptedSecretStore {
    /// Without a master password every operation reports the store as
    /// unavailable.
    pub fn new(
        base_path: impl AsRef<Path>,
        master_password: Option<SecretString>,
        kdf: KdfParams,
    ) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            master_password,
            kdf,
        }
    }

    /// Get the path for an entry file
    fn entry_path(&self, id: &str) -> PathBuf {
        let file_name: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_path.join(format!("{}.json", file_name))
    }

    fn master_password(&self) -> Result<&SecretString> {
        self.master_password.as_ref().ok_or_else(|| {
            CipherpadError::SecretStoreUnavailable("no master password configured".to_string())
        })
    }
}

fn unavailable(e: impl std::fmt::Display) -> CipherpadError {
    CipherpadError::SecretStoreUnavailable(e.to_string())
}

#[async_trait]
impl SecretStore for EncryptedSecretStore {
    async fn get(&self, id: &str) -> Result<Option<SecureString>> {
        let password = self.master_password()?.expose_secret().clone();
        let path = self.entry_path(id);

        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(e)),
        };
        let file: EncryptedSecretFile = serde_json::from_str(&json).map_err(unavailable)?;

        let opened = tokio::task::spawn_blocking(move || {
            let password = SecureString::from(password);
            file.sealed.open(password.expose())
        })
        .await
        .map_err(unavailable)?
        .map_err(|e| unavailable(format!("cannot open entry: {}", e)))?;

        let value = String::from_utf8(opened.to_vec()).map_err(unavailable)?;
        Ok(Some(SecureString::from(value)))
    }

    async fn set(&self, id: &str, value: &SecureString) -> Result<()> {
        let password = SecureString::from(self.master_password()?.expose_secret().as_str());
        let kdf = self.kdf;
        let value = value.clone();

        let sealed = tokio::task::spawn_blocking(move || {
            SealedSecret::seal(value.expose().as_bytes(), password.expose(), kdf)
        })
        .await
        .map_err(unavailable)?
        .map_err(unavailable)?;

        let file = EncryptedSecretFile {
            version: 1,
            id: id.to_string(),
            sealed,
            created_at: chrono::Utc::now().timestamp(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        fsutil::write_atomic(self.entry_path(id), json)
            .await
            .map_err(unavailable)?;

        debug!("Stored secret entry {}", id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.master_password()?;
        match tokio::fs::remove_file(self.entry_path(id)).await {
            Ok(()) => {
                debug!("Deleted secret entry {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::test_kdf;
    use tempfile::tempdir;

    fn master(password: &str) -> Option<SecretString> {
        Some(SecretString::new(password.to_string()))
    }

    #[tokio::test]
    async fn test_encrypted_store_round_trip() {
        let dir = tempdir().unwrap();
        let id = passphrase_entry_id("ABCD");

        {
            let store = EncryptedSecretStore::new(dir.path(), master("master"), test_kdf());
            store.set(&id, &SecureString::from("x")).await.unwrap();
        }

        let store = EncryptedSecretStore::new(dir.path(), master("master"), test_kdf());
        let value = store.get(&id).await.unwrap().unwrap();
        assert_eq!(value.expose(), "x");

        // Stored form is not plaintext
        let raw = std::fs::read_to_string(store.entry_path(&id)).unwrap();
        assert!(raw.contains("\"sealed\""));
        assert!(!raw.contains("\"x\""));

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        // Deleting again is fine
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_master_password_is_unavailable() {
        let dir = tempdir().unwrap();
        let id = passphrase_entry_id("ABCD");

        let store = EncryptedSecretStore::new(dir.path(), master("right"), test_kdf());
        store.set(&id, &SecureString::from("x")).await.unwrap();

        let other = EncryptedSecretStore::new(dir.path(), master("wrong"), test_kdf());
        assert!(matches!(
            other.get(&id).await,
            Err(CipherpadError::SecretStoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_master_password_is_unavailable() {
        let dir = tempdir().unwrap();
        let store = EncryptedSecretStore::new(dir.path(), None, test_kdf());
        assert!(matches!(
            store.get("anything").await,
            Err(CipherpadError::SecretStoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySecretStore::new();
        store.set("a", &SecureString::from("1")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().expose(), "1");
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[test]
    fn test_entry_path_is_sanitized() {
        let store = EncryptedSecretStore::new("/tmp/secrets", None, test_kdf());
        let path = store.entry_path("cipherpad.passphrase.../../etc");
        assert_eq!(path.parent().unwrap(), Path::new("/tmp/secrets"));
    }
}
