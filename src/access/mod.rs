//! Encrypted file access
//!
//! [`EncryptedAccess`] is the entry point hosts use: it reads and writes
//! encrypted files, and manages the keys those operations rely on.
//!
//! - Reads try every private key in listing order until one succeeds and
//!   fall back to the raw bytes with a warning when none does.
//! - Writes never fall back: without a usable recipient nothing is
//!   written.

pub mod prompt;
mod read;
mod write;

pub use prompt::{NoPrompter, Prompter, TerminalPrompter};
pub use read::ReadOutcome;
pub use write::{WriteOptions, WriteReport};

use crate::config::{Config, KeysConfig, SecretStoreKind};
use crate::crypto::armor;
use crate::crypto::envelope::parse_block;
use crate::crypto::{KeyCipher, SealedBoxCipher};
use crate::errors::{CipherpadError, Result};
use crate::keystore::{
    passphrase_entry_id, EncryptedSecretStore, ExternalKeyLoader, JsonFileStateStore,
    KeyKind, KeyListing, KeyRecord, KeyRegistry, MemorySecretStore, SecretStore,
};
use crate::passphrase::{PassphraseResolver, ResolveOptions};
use crate::security::SecureString;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Outcome of a key removal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// The key comes from an external path and cannot be removed
    Protected,
    NotFound,
}

/// Behaviour switches for reads, writes and imports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSettings {
    pub external_paths: Vec<PathBuf>,
    pub prompt_for_passphrase: bool,
    pub remember_passphrase: bool,
    pub warn_if_no_private_key: bool,
}

impl Default for AccessSettings {
    fn default() -> Self {
        AccessSettings::from(&KeysConfig::default())
    }
}

impl From<&KeysConfig> for AccessSettings {
    fn from(keys: &KeysConfig) -> Self {
        Self {
            external_paths: keys.external_paths.clone(),
            prompt_for_passphrase: keys.prompt_for_passphrase,
            remember_passphrase: keys.remember_passphrase,
            warn_if_no_private_key: keys.warn_if_no_private_key,
        }
    }
}

impl AccessSettings {
    fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            allow_prompt: self.prompt_for_passphrase,
            remember: self.remember_passphrase,
        }
    }
}

/// Reads, writes and key management over one key registry
pub struct EncryptedAccess {
    registry: Arc<KeyRegistry>,
    cipher: Arc<dyn KeyCipher>,
    secrets: Arc<dyn SecretStore>,
    prompter: Arc<dyn Prompter>,
    resolver: PassphraseResolver,
    settings: RwLock<AccessSettings>,
}

impl EncryptedAccess {
    pub fn new(
        registry: Arc<KeyRegistry>,
        cipher: Arc<dyn KeyCipher>,
        secrets: Arc<dyn SecretStore>,
        prompter: Arc<dyn Prompter>,
        settings: AccessSettings,
    ) -> Self {
        let resolver = PassphraseResolver::new(cipher.clone(), secrets.clone(), prompter.clone());
        Self {
            registry,
            cipher,
            secrets,
            prompter,
            resolver,
            settings: RwLock::new(settings),
        }
    }

    /// Wire up stores, cipher and registry from configuration, then load
    /// the configured external keys.
    pub async fn open(config: &Config, prompter: Arc<dyn Prompter>) -> Result<Self> {
        let kdf = config.security.kdf();
        let cipher: Arc<dyn KeyCipher> = Arc::new(SealedBoxCipher::new(kdf));

        let secrets: Arc<dyn SecretStore> = match config.storage.secret_store {
            SecretStoreKind::Memory => Arc::new(MemorySecretStore::new()),
            SecretStoreKind::Encrypted => {
                let master = std::env::var(&config.security.master_password_env)
                    .ok()
                    .filter(|p| !p.is_empty())
                    .map(SecretString::new);
                if master.is_none() {
                    warn!(
                        "{} not set, remembered passphrases are unavailable",
                        config.security.master_password_env
                    );
                }
                Arc::new(EncryptedSecretStore::new(
                    &config.storage.secrets_path,
                    master,
                    kdf,
                ))
            }
        };

        let state = Arc::new(JsonFileStateStore::new(&config.storage.state_path));
        let loader = Arc::new(ExternalKeyLoader::new(cipher.clone()));
        let registry =
            Arc::new(KeyRegistry::open(state, secrets.clone(), loader).await?);

        if let Some(seed) = &config.keys.default_recipient {
            if registry.default_recipient().await?.is_none() {
                registry.set_default_recipient(Some(seed)).await?;
            }
        }

        let access = Self::new(
            registry,
            cipher,
            secrets,
            prompter,
            AccessSettings::from(&config.keys),
        );
        access.reload_from_config().await;
        Ok(access)
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub async fn settings(&self) -> AccessSettings {
        self.settings.read().await.clone()
    }

    /// Replace the settings. A change of external paths triggers a reload,
    /// which supersedes any reload still running.
    pub async fn apply_settings(&self, settings: AccessSettings) {
        let paths_changed = {
            let mut current = self.settings.write().await;
            let changed = current.external_paths != settings.external_paths;
            *current = settings;
            changed
        };
        if paths_changed {
            self.reload_from_config().await;
        }
    }

    /// Import every key block in `armored`. A private key also registers
    /// its public half unless a managed public record already exists.
    ///
    /// Blocks that fail to parse are skipped; the import fails only when
    /// nothing could be imported.
    pub async fn import_key(&self, armored: &str) -> Result<Vec<KeyRecord>> {
        let Some(kind) = armor::classify(armored) else {
            return Err(CipherpadError::InvalidKeyFormat(
                "No armored key block found".to_string(),
            ));
        };
        let blocks = armor::find_key_blocks(armored);
        debug!("Importing {} key blocks ({} material)", blocks.len(), kind);

        let mut imported = Vec::new();
        let mut last_error = None;

        for block in &blocks {
            let parsed = match parse_block(self.cipher.as_ref(), block) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Skipping key block: {}", e);
                    last_error = Some(e);
                    continue;
                }
            };

            let record = KeyRecord::managed(
                &parsed.key_id,
                &parsed.user_id,
                parsed.kind,
                block.text,
            );
            self.registry.put(record.clone()).await?;
            imported.push(record);

            if parsed.kind == KeyKind::Private {
                let view = self.registry.view().await;
                let has_public = view
                    .get(&parsed.key_id, KeyKind::Public)
                    .map(|r| !r.is_external())
                    .unwrap_or(false);
                let in_batch = imported
                    .iter()
                    .any(|r| r.key_id == parsed.key_id && r.kind == KeyKind::Public);

                if !has_public && !in_batch {
                    let public = self.cipher.public_from_private(block.text)?;
                    let record = KeyRecord::managed(
                        &parsed.key_id,
                        &parsed.user_id,
                        KeyKind::Public,
                        public,
                    );
                    self.registry.put(record.clone()).await?;
                    imported.push(record);
                }
            }
        }

        match (imported.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            (true, None) => Err(CipherpadError::InvalidKeyFormat(
                "Unterminated key block".to_string(),
            )),
            _ => Ok(imported),
        }
    }

    pub async fn remove_key(&self, key_id: &str, kind: KeyKind) -> Result<RemoveOutcome> {
        match self.registry.remove(key_id, kind).await {
            Ok(true) => Ok(RemoveOutcome::Removed),
            Ok(false) => Ok(RemoveOutcome::NotFound),
            Err(CipherpadError::ImmutableKeyRemoval(identity)) => {
                info!("Refusing to remove external key {}", identity);
                Ok(RemoveOutcome::Protected)
            }
            Err(e) => Err(e),
        }
    }

    /// Rescan `paths` for external keys; returns the published generation
    pub async fn reload_external_keys(&self, paths: Vec<PathBuf>) -> u64 {
        self.registry.external().reload(paths).await
    }

    /// Rescan the configured external paths
    pub async fn reload_from_config(&self) -> u64 {
        let paths = self.settings.read().await.external_paths.clone();
        self.reload_external_keys(paths).await
    }

    /// Managed and external key summaries, after any reload in progress
    pub async fn list_keys(&self) -> KeyListing {
        self.registry.settled_view().await.listing()
    }

    /// Generate a key pair and import both halves. With a passphrase the
    /// private half is protected, and the passphrase is remembered when
    /// configured to.
    pub async fn generate_key(
        &self,
        user_id: &str,
        passphrase: Option<&SecureString>,
    ) -> Result<Vec<KeyRecord>> {
        let generated = self.cipher.generate(user_id, passphrase).await?;

        let public = KeyRecord::managed(
            &generated.key_id,
            &generated.user_id,
            KeyKind::Public,
            generated.public_armor,
        );
        let private = KeyRecord::managed(
            &generated.key_id,
            &generated.user_id,
            KeyKind::Private,
            generated.private_armor,
        );
        self.registry.put(public.clone()).await?;
        self.registry.put(private.clone()).await?;

        if let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) {
            if self.settings.read().await.remember_passphrase {
                let id = passphrase_entry_id(&generated.key_id);
                if let Err(e) = self.secrets.set(&id, passphrase).await {
                    warn!("Could not remember passphrase for {}: {}", generated.key_id, e);
                }
            }
        }

        info!("Generated key {} for {}", generated.key_id, generated.user_id);
        Ok(vec![public, private])
    }

    /// Armored text of a key, managed first, then external
    pub async fn export_key(&self, key_id: &str, kind: KeyKind) -> Result<String> {
        self.registry
            .get(key_id, kind)
            .await
            .map(|record| record.material)
            .ok_or_else(|| CipherpadError::KeyNotFound(format!("{} ({})", key_id, kind)))
    }

    /// Set or clear the default recipient. A new recipient must be a known
    /// public key.
    pub async fn set_default_recipient(&self, key_id: Option<&str>) -> Result<()> {
        if let Some(id) = key_id {
            let view = self.registry.settled_view().await;
            if view.get(id, KeyKind::Public).is_none() {
                return Err(CipherpadError::KeyNotFound(format!("{} (public)", id)));
            }
        }
        self.registry.set_default_recipient(key_id).await
    }

    /// The default recipient, if it still refers to a known public key
    pub async fn default_recipient(&self) -> Result<Option<String>> {
        let Some(id) = self.registry.default_recipient().await? else {
            return Ok(None);
        };
        let view = self.registry.settled_view().await;
        if view.get(&id, KeyKind::Public).is_some() {
            Ok(Some(id))
        } else {
            debug!("Default recipient {} no longer exists", id);
            Ok(None)
        }
    }

    /// Forget the remembered passphrase of a key
    pub async fn forget_passphrase(&self, key_id: &str) -> Result<()> {
        self.secrets.delete(&passphrase_entry_id(key_id)).await?;
        info!("Forgot passphrase for {}", key_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::test_kdf;
    use crate::keystore::MemoryStateStore;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    async fn access() -> EncryptedAccess {
        let cipher: Arc<dyn KeyCipher> = Arc::new(SealedBoxCipher::new(test_kdf()));
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let loader = Arc::new(ExternalKeyLoader::new(cipher.clone()));
        let registry = KeyRegistry::open(Arc::new(MemoryStateStore::new()), secrets.clone(), loader)
            .await
            .unwrap();
        EncryptedAccess::new(
            Arc::new(registry),
            cipher,
            secrets,
            Arc::new(NoPrompter),
            AccessSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_import_private_registers_public_half() {
        let access = access().await;
        let key = access.cipher.generate("Alice", None).await.unwrap();

        let imported = access.import_key(&key.private_armor).await.unwrap();
        let kinds: Vec<_> = imported.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![KeyKind::Private, KeyKind::Public]);

        let listing = access.list_keys().await;
        assert_eq!(listing.managed.len(), 2);
        assert_eq!(
            access.export_key(&key.key_id, KeyKind::Public).await.unwrap(),
            key.public_armor
        );
    }

    #[tokio::test]
    async fn test_import_bundle_skips_bad_blocks() {
        let access = access().await;
        let key = access.cipher.generate("Bob", None).await.unwrap();
        let broken = format!("{}\n@@@\n{}", armor::PUBLIC_KEY_BEGIN, armor::PUBLIC_KEY_END);

        let bundle = format!("{}\n{}\n{}", key.public_armor, broken, key.private_armor);
        let imported = access.import_key(&bundle).await.unwrap();
        // Public came with the bundle, so no derived copy is added
        assert_eq!(imported.len(), 2);
    }

    #[tokio::test]
    async fn test_import_without_blocks_fails() {
        let access = access().await;
        assert!(matches!(
            access.import_key("hello").await,
            Err(CipherpadError::InvalidKeyFormat(_))
        ));
        let broken = format!("{}\n@@@\n{}", armor::PUBLIC_KEY_BEGIN, armor::PUBLIC_KEY_END);
        assert!(access.import_key(&broken).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_outcomes() {
        let access = access().await;
        let dir = tempdir().unwrap();
        let external = access.cipher.generate("External", None).await.unwrap();
        fs::write(dir.path().join("ext.asc"), &external.public_armor).unwrap();
        access
            .apply_settings(AccessSettings {
                external_paths: vec![dir.path().to_path_buf()],
                ..AccessSettings::default()
            })
            .await;

        let managed = access.generate_key("Managed", None).await.unwrap();
        let id = &managed[0].key_id;

        assert_eq!(
            access.remove_key(id, KeyKind::Private).await.unwrap(),
            RemoveOutcome::Removed
        );
        assert_eq!(
            access.remove_key(id, KeyKind::Private).await.unwrap(),
            RemoveOutcome::NotFound
        );
        assert_eq!(
            access
                .remove_key(&external.key_id, KeyKind::Public)
                .await
                .unwrap(),
            RemoveOutcome::Protected
        );
    }

    #[tokio::test]
    async fn test_default_recipient_validation_and_dangling() {
        let access = access().await;
        assert!(matches!(
            access.set_default_recipient(Some("NOPE")).await,
            Err(CipherpadError::KeyNotFound(_))
        ));

        let key = access.generate_key("Carol", None).await.unwrap();
        let id = key[0].key_id.clone();
        access.set_default_recipient(Some(&id)).await.unwrap();
        assert_eq!(access.default_recipient().await.unwrap(), Some(id.clone()));

        access.remove_key(&id, KeyKind::Public).await.unwrap();
        assert_eq!(access.default_recipient().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_generate_remembers_passphrase_when_configured() {
        let access = access().await;
        access
            .apply_settings(AccessSettings {
                remember_passphrase: true,
                ..AccessSettings::default()
            })
            .await;

        let passphrase = SecureString::from("x");
        let key = access.generate_key("Dave", Some(&passphrase)).await.unwrap();
        let id = passphrase_entry_id(&key[0].key_id);
        assert_eq!(access.secrets.get(&id).await.unwrap(), Some(passphrase));

        access.forget_passphrase(&key[0].key_id).await.unwrap();
        assert_eq!(access.secrets.get(&id).await.unwrap(), None);
    }
}
