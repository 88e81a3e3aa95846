//! Error types for cipherpad

use std::fmt;
use thiserror::Error;

/// Why a decryption attempt failed.
///
/// The distinction is best-effort: a cipher backend that cannot tell the
/// cases apart reports `Unknown`, and callers must treat every variant the
/// same way (move on to the next candidate key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    /// The key matches the message but the secret does not unlock it
    WrongSecret,
    /// The key is not the one the message was encrypted for
    KeyMismatch,
    /// The ciphertext or key material could not be decoded
    Malformed,
    Unknown,
}

impl fmt::Display for DecryptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DecryptFailure::WrongSecret => "wrong passphrase for this key",
            DecryptFailure::KeyMismatch => "key does not match the message recipient",
            DecryptFailure::Malformed => "malformed ciphertext or key material",
            DecryptFailure::Unknown => "unknown failure",
        };
        f.write_str(text)
    }
}

/// Main error type for cipherpad operations
#[derive(Error, Debug)]
pub enum CipherpadError {
    // Key management errors
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Key is loaded from an external path and cannot be modified: {0}")]
    ImmutableKeyRemoval(String),

    // Cryptographic errors
    #[error("Decryption failed: {0}")]
    DecryptionFailed(DecryptFailure),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("No private key available")]
    NoPrivateKeyAvailable,

    #[error("No public key available to encrypt for")]
    NoPublicKeyAvailable,

    #[error("Write cancelled")]
    WriteCancelled,

    // Storage errors
    #[error("Secret store unavailable: {0}")]
    SecretStoreUnavailable(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for CipherpadError {
    fn from(err: std::io::Error) -> Self {
        CipherpadError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for CipherpadError {
    fn from(err: serde_json::Error) -> Self {
        CipherpadError::StorageError(format!("JSON error: {}", err))
    }
}

impl From<base64::DecodeError> for CipherpadError {
    fn from(err: base64::DecodeError) -> Self {
        CipherpadError::InvalidKeyFormat(format!("Base64 decode error: {}", err))
    }
}

impl From<config::ConfigError> for CipherpadError {
    fn from(err: config::ConfigError) -> Self {
        CipherpadError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CipherpadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_failure_message() {
        let err = CipherpadError::DecryptionFailed(DecryptFailure::WrongSecret);
        assert_eq!(
            err.to_string(),
            "Decryption failed: wrong passphrase for this key"
        );
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CipherpadError = io.into();
        assert!(matches!(err, CipherpadError::StorageError(_)));
    }
}
