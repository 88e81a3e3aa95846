//! Cryptographic building blocks
//!
//! - ASCII armor scanning and encoding
//! - Passphrase protection (Argon2id + AES-256-GCM)
//! - The public-key envelope consumed by the key engine

pub mod armor;
pub mod envelope;
pub mod kdf;

pub use envelope::{GeneratedKey, KeyCipher, ParsedKey, SealedBoxCipher};
pub use kdf::{KdfParams, SealedSecret};
