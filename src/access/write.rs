//! Write path: pick a recipient, encrypt, replace the file atomically

use super::EncryptedAccess;
use crate::errors::{CipherpadError, Result};
use crate::fsutil;
use crate::keystore::{KeyKind, KeyRecord, RegistryView};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Encrypt for this key instead of the default recipient
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub recipient_key_id: String,
    /// Advisory only; the write went through
    pub warning: Option<String>,
}

impl EncryptedAccess {
    /// Encrypt `plaintext` and replace `path` with the ciphertext.
    ///
    /// Fails with `NoPublicKeyAvailable` when there is nothing to encrypt
    /// for and `WriteCancelled` when the user declines to pick a
    /// recipient. On any failure the file on disk is left as it was.
    pub async fn write_encrypted(
        &self,
        path: &Path,
        plaintext: &[u8],
        options: &WriteOptions,
    ) -> Result<WriteReport> {
        let view = self.registry.settled_view().await;
        let recipient = self.resolve_recipient(&view, options).await?;

        let mut warning = None;
        if self.settings.read().await.warn_if_no_private_key
            && view.get(&recipient.key_id, KeyKind::Private).is_none()
        {
            let message = format!(
                "No private key for recipient {}; {} cannot be decrypted here after saving",
                recipient.key_id,
                path.display()
            );
            warn!("{}", message);
            warning = Some(message);
        }

        let ciphertext = self.cipher.encrypt(plaintext, &recipient.material).await?;
        fsutil::write_atomic(path.to_path_buf(), ciphertext).await?;

        info!("Wrote {:?} for recipient {}", path, recipient.key_id);
        Ok(WriteReport {
            recipient_key_id: recipient.key_id,
            warning,
        })
    }

    async fn resolve_recipient(
        &self,
        view: &RegistryView,
        options: &WriteOptions,
    ) -> Result<KeyRecord> {
        let publics = view.list_by_kind(KeyKind::Public);
        if publics.is_empty() {
            return Err(CipherpadError::NoPublicKeyAvailable);
        }

        if let Some(id) = &options.recipient {
            return view
                .get(id, KeyKind::Public)
                .cloned()
                .ok_or_else(|| CipherpadError::KeyNotFound(format!("{} (public)", id)));
        }

        if let Some(id) = self.registry.default_recipient().await? {
            match view.get(&id, KeyKind::Public) {
                Some(record) => return Ok(record.clone()),
                None => debug!("Default recipient {} no longer exists", id),
            }
        }

        if let [only] = publics.as_slice() {
            return Ok((*only).clone());
        }

        let labels: Vec<String> = publics
            .iter()
            .map(|r| format!("{} ({})", r.user_id, r.key_id))
            .collect();
        match self
            .prompter
            .select_one(&labels, "Select a recipient")
            .await?
        {
            Some(index) => publics
                .get(index)
                .map(|r| (*r).clone())
                .ok_or(CipherpadError::WriteCancelled),
            None => Err(CipherpadError::WriteCancelled),
        }
    }
}
