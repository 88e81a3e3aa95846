//! Passphrase protection
//!
//! Seals small secrets (private key bytes, stored passphrases) with
//! AES-256-GCM under a key derived from a passphrase using Argon2id.

use crate::errors::{CipherpadError, DecryptFailure, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Salt size for Argon2
const SALT_SIZE: usize = 16;

/// Nonce size for AES-GCM
const NONCE_SIZE: usize = 12;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536, // 64 MB
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Derive a 256-bit key from `password`
    pub fn derive_key(&self, password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(32),
        )
        .map_err(|e| CipherpadError::EncryptionFailed(e.to_string()))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut output = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut output[..])
            .map_err(|e| CipherpadError::EncryptionFailed(e.to_string()))?;

        Ok(output)
    }
}

/// A secret sealed under a passphrase. Everything needed to open it
/// except the passphrase travels with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub kdf: KdfParams,
    /// Salt for key derivation (base64)
    pub salt: String,
    /// Nonce for AES-GCM (base64)
    pub nonce: String,
    /// Encrypted secret (base64)
    pub ciphertext: String,
}

impl SealedSecret {
    pub fn seal(secret: &[u8], password: &str, kdf: KdfParams) -> Result<Self> {
        let mut salt_bytes = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt_bytes);

        let key = kdf.derive_key(password, &salt_bytes)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| CipherpadError::EncryptionFailed(e.to_string()))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret)
            .map_err(|e| CipherpadError::EncryptionFailed(e.to_string()))?;

        Ok(Self {
            kdf,
            salt: STANDARD.encode(salt_bytes),
            nonce: STANDARD.encode(nonce_bytes),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    /// Open the sealed secret. A wrong password reports `WrongSecret`,
    /// undecodable fields report `Malformed`.
    pub fn open(&self, password: &str) -> std::result::Result<Zeroizing<Vec<u8>>, DecryptFailure> {
        let salt = STANDARD
            .decode(&self.salt)
            .map_err(|_| DecryptFailure::Malformed)?;
        let nonce = STANDARD
            .decode(&self.nonce)
            .map_err(|_| DecryptFailure::Malformed)?;
        let ciphertext = STANDARD
            .decode(&self.ciphertext)
            .map_err(|_| DecryptFailure::Malformed)?;

        if nonce.len() != NONCE_SIZE {
            return Err(DecryptFailure::Malformed);
        }

        let key = self
            .kdf
            .derive_key(password, &salt)
            .map_err(|_| DecryptFailure::Malformed)?;

        let cipher =
            Aes256Gcm::new_from_slice(&key[..]).map_err(|_| DecryptFailure::Malformed)?;

        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| DecryptFailure::WrongSecret)
    }
}

#[cfg(test)]
pub(crate) fn test_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}
