//! Passphrase resolution for private keys
//!
//! Decides which secret, if any, to try a private key with. Failures never
//! escape: anything that goes wrong turns into [`Resolution::Skip`] so the
//! caller simply moves on to its next key.

use crate::access::prompt::Prompter;
use crate::crypto::KeyCipher;
use crate::keystore::secrets::{passphrase_entry_id, SecretStore};
use crate::keystore::KeyRecord;
use crate::security::SecureString;
use std::sync::Arc;
use tracing::{debug, warn};

/// Caller-controlled resolution behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Ask the user when no passphrase is stored
    pub allow_prompt: bool,
    /// Store a prompted passphrase for next time
    pub remember: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            allow_prompt: true,
            remember: false,
        }
    }
}

/// Where a resolved secret came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    /// The key is not protected; the secret is empty
    Unprotected,
    /// Read from the secret store
    Stored,
    /// Typed in by the user
    Prompted,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Try the key with this secret
    Secret(SecureString, SecretSource),
    /// Do not try this key
    Skip,
}

pub struct PassphraseResolver {
    cipher: Arc<dyn KeyCipher>,
    secrets: Arc<dyn SecretStore>,
    prompter: Arc<dyn Prompter>,
}

impl PassphraseResolver {
    pub fn new(
        cipher: Arc<dyn KeyCipher>,
        secrets: Arc<dyn SecretStore>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self {
            cipher,
            secrets,
            prompter,
        }
    }

    pub async fn resolve(&self, record: &KeyRecord, options: &ResolveOptions) -> Resolution {
        match self.cipher.is_passphrase_protected(&record.material) {
            Ok(false) => return Resolution::Secret(SecureString::empty(), SecretSource::Unprotected),
            Ok(true) => {}
            Err(e) => {
                warn!("Cannot inspect private key {}: {}", record.key_id, e);
                return Resolution::Skip;
            }
        }

        let entry_id = passphrase_entry_id(&record.key_id);
        match self.secrets.get(&entry_id).await {
            Ok(Some(stored)) => {
                debug!("Using stored passphrase for {}", record.key_id);
                return Resolution::Secret(stored, SecretSource::Stored);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Secret store unavailable for {}: {}", record.key_id, e);
                return Resolution::Skip;
            }
        }

        if !options.allow_prompt {
            debug!("No passphrase for {} and prompting is off", record.key_id);
            return Resolution::Skip;
        }

        let label = format!("Passphrase for {} ({})", record.user_id, record.key_id);
        let secret = match self.prompter.prompt_secret(&label).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                debug!("Passphrase prompt for {} cancelled", record.key_id);
                return Resolution::Skip;
            }
            Err(e) => {
                warn!("Passphrase prompt for {} failed: {}", record.key_id, e);
                return Resolution::Skip;
            }
        };

        Resolution::Secret(secret, SecretSource::Prompted)
    }

    /// Record that `secret` unlocked `record`. A prompted passphrase is
    /// stored when `options.remember` is set.
    pub async fn confirm(
        &self,
        record: &KeyRecord,
        secret: &SecureString,
        source: SecretSource,
        options: &ResolveOptions,
    ) {
        if source != SecretSource::Prompted || !options.remember {
            return;
        }
        let entry_id = passphrase_entry_id(&record.key_id);
        if let Err(e) = self.secrets.set(&entry_id, secret).await {
            warn!("Could not remember passphrase for {}: {}", record.key_id, e);
        }
    }

    /// Record that the secret from `source` did not unlock `record`. A
    /// stored passphrase is dropped so the next resolution prompts again.
    pub async fn reject(&self, record: &KeyRecord, source: SecretSource) {
        if source != SecretSource::Stored {
            return;
        }
        warn!("Stored passphrase for {} is wrong, forgetting it", record.key_id);
        let entry_id = passphrase_entry_id(&record.key_id);
        if let Err(e) = self.secrets.delete(&entry_id).await {
            warn!("Could not forget passphrase for {}: {}", record.key_id, e);
        }
    }
}
