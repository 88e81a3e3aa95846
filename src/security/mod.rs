//! Secure handling of plaintext and secrets held in memory
//!
//! Decrypted file contents and passphrases only ever live in these
//! wrappers, which zero their buffers on drop.

pub mod zeroize;

pub use self::zeroize::{SecureBytes, SecureString};
