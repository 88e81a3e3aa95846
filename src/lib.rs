//! cipherpad - transparent at-rest encryption for edited files
//!
//! Files are stored encrypted for a recipient's public key and decrypted
//! on read by trying every known private key in turn. Keys come from two
//! places:
//!
//! - managed keys, imported or generated and persisted in a state file
//! - external keys, scanned from configured files and directories and
//!   never persisted
//!
//! Passphrases for protected private keys are looked up in a secret store,
//! prompted for, or skipped, depending on configuration.
//!
//! ```no_run
//! use cipherpad::{Config, EncryptedAccess, NoPrompter};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> cipherpad::Result<()> {
//! let config = Config::load(None)?;
//! let access = EncryptedAccess::open(&config, Arc::new(NoPrompter)).await?;
//! let outcome = access.read_encrypted(Path::new("notes.txt.asc")).await?;
//! if let Some(warning) = &outcome.warning {
//!     eprintln!("{}", warning);
//! }
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod fsutil;
pub mod keystore;
pub mod passphrase;
pub mod security;

pub use access::{
    AccessSettings, EncryptedAccess, NoPrompter, Prompter, ReadOutcome, RemoveOutcome,
    TerminalPrompter, WriteOptions, WriteReport,
};
pub use config::Config;
pub use crypto::{KeyCipher, SealedBoxCipher};
pub use errors::{CipherpadError, DecryptFailure, Result};
pub use keystore::{KeyKind, KeyListing, KeyRecord, KeyRegistry, KeySummary};
pub use security::{SecureBytes, SecureString};
