//! Read path: trial decryption over every private key

use super::EncryptedAccess;
use crate::crypto::armor;
use crate::errors::{CipherpadError, DecryptFailure, Result};
use crate::keystore::KeyKind;
use crate::passphrase::Resolution;
use crate::security::SecureBytes;
use std::path::Path;
use tracing::{debug, info, warn};

/// What a read produced
#[derive(Debug)]
pub struct ReadOutcome {
    /// Decrypted content, or the file's raw bytes when decryption was not
    /// possible
    pub content: SecureBytes,
    /// Key that decrypted the content
    pub used_key_id: Option<String>,
    /// Set when `content` is the raw file
    pub warning: Option<String>,
    /// Why decryption was not possible: `NoPrivateKeyAvailable` when no
    /// key was tried, otherwise `DecryptionFailed` with the last failure
    pub fallback: Option<CipherpadError>,
    /// Number of decryption attempts made
    pub attempts: usize,
    /// External key generation the read worked against
    pub external_generation: u64,
}

impl ReadOutcome {
    pub fn is_decrypted(&self) -> bool {
        self.used_key_id.is_some()
    }
}

impl EncryptedAccess {
    /// Read and decrypt `path`.
    ///
    /// Private keys are tried in listing order until one succeeds. When
    /// none does, the raw bytes come back with a warning instead of an
    /// error. Only I/O errors on the file itself fail the read. The file is
    /// never modified.
    pub async fn read_encrypted(&self, path: &Path) -> Result<ReadOutcome> {
        let bytes = tokio::fs::read(path).await?;

        let view = self.registry.settled_view().await;
        let external_generation = view.external_generation();

        if bytes.is_empty() {
            debug!("{:?} is empty, nothing to decrypt", path);
            return Ok(ReadOutcome {
                content: SecureBytes::default(),
                used_key_id: None,
                warning: None,
                fallback: None,
                attempts: 0,
                external_generation,
            });
        }

        let candidates: Vec<_> = view
            .list_by_kind(KeyKind::Private)
            .into_iter()
            .cloned()
            .collect();
        let options = self.settings.read().await.resolve_options();

        if candidates.is_empty() {
            let reason = CipherpadError::NoPrivateKeyAvailable;
            let warning = format!("{}; showing {} as stored", reason, path.display());
            warn!("{}", warning);
            return Ok(ReadOutcome {
                content: SecureBytes::new(bytes),
                used_key_id: None,
                warning: Some(warning),
                fallback: Some(reason),
                attempts: 0,
                external_generation,
            });
        }

        if !armor::is_message(&bytes) {
            debug!("{:?} is not an armored message, trying keys anyway", path);
        }

        let mut attempts = 0;
        let mut last_failure = None;
        for candidate in &candidates {
            let (secret, source) = match self.resolver.resolve(candidate, &options).await {
                Resolution::Secret(secret, source) => (secret, source),
                Resolution::Skip => {
                    debug!("Skipping key {}", candidate.key_id);
                    continue;
                }
            };

            attempts += 1;
            let unlock = (!secret.is_empty()).then_some(&secret);
            match self
                .cipher
                .decrypt(&bytes, &candidate.material, unlock)
                .await
            {
                Ok(content) => {
                    info!("Decrypted {:?} with key {}", path, candidate.key_id);
                    self.resolver
                        .confirm(candidate, &secret, source, &options)
                        .await;
                    return Ok(ReadOutcome {
                        content,
                        used_key_id: Some(candidate.key_id.clone()),
                        warning: None,
                        fallback: None,
                        attempts,
                        external_generation,
                    });
                }
                Err(failure) => {
                    debug!("Key {} did not decrypt {:?}: {}", candidate.key_id, path, failure);
                    if failure == DecryptFailure::WrongSecret {
                        self.resolver.reject(candidate, source).await;
                    }
                    last_failure = Some(failure);
                }
            }
        }

        // Every candidate skipped counts as having no usable key
        let reason = match last_failure {
            Some(failure) => CipherpadError::DecryptionFailed(failure),
            None => CipherpadError::NoPrivateKeyAvailable,
        };
        let warning = format!(
            "Could not decrypt {} with any of {} private keys ({}); showing it as stored",
            path.display(),
            candidates.len(),
            reason
        );
        warn!("{}", warning);
        Ok(ReadOutcome {
            content: SecureBytes::new(bytes),
            used_key_id: None,
            warning: Some(warning),
            fallback: Some(reason),
            attempts,
            external_generation,
        })
    }
}
