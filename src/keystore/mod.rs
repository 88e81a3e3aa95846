//! Key storage and management
//!
//! This module provides:
//! - Key records and their composite identities
//! - The key registry over managed and external keys
//! - The external key loader
//! - Host-provided state and secret storage

pub mod loader;
pub mod record;
pub mod registry;
pub mod secrets;
pub mod state;

pub use loader::{ExternalKeyLoader, ExternalSnapshot};
pub use record::{KeyIdentity, KeyKind, KeyListing, KeyOrigin, KeyRecord, KeySummary, StoredKey};
pub use registry::{KeyRegistry, PutOutcome, RegistryView};
pub use secrets::{
    passphrase_entry_id, EncryptedSecretStore, MemorySecretStore, SecretStore,
};
pub use state::{JsonFileStateStore, MemoryStateStore, StateStore};
