//! Key registry
//!
//! Unifies managed keys (imported or generated, persisted through the
//! [`StateStore`]) with the external overlay published by the
//! [`ExternalKeyLoader`]. Managed records win over external ones with the
//! same `(key_id, kind)`.
//!
//! Mutations build a new managed map and swap it in, so a reader holding a
//! [`RegistryView`] keeps a consistent picture for as long as it needs.

use crate::errors::{CipherpadError, Result};
use crate::keystore::loader::{ExternalKeyLoader, ExternalSnapshot};
use crate::keystore::record::{
    KeyIdentity, KeyKind, KeyListing, KeyOrigin, KeyRecord, StoredKey,
};
use crate::keystore::secrets::{passphrase_entry_id, SecretStore};
use crate::keystore::state::StateStore;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// State key holding the managed key list
pub const KEYS_STATE_KEY: &str = "keys";

/// State key holding the default recipient id
pub const DEFAULT_RECIPIENT_STATE_KEY: &str = "defaultRecipient";

/// Whether `put` added a record or replaced one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Added,
    Updated,
}

/// Managed records in registration order
#[derive(Debug, Clone, Default)]
struct ManagedKeys {
    next_seq: u64,
    order: BTreeMap<u64, KeyRecord>,
    by_identity: HashMap<KeyIdentity, u64>,
}

impl ManagedKeys {
    fn get(&self, identity: &KeyIdentity) -> Option<&KeyRecord> {
        self.by_identity
            .get(identity)
            .and_then(|seq| self.order.get(seq))
    }

    fn contains(&self, identity: &KeyIdentity) -> bool {
        self.by_identity.contains_key(identity)
    }

    fn insert(&mut self, record: KeyRecord) -> PutOutcome {
        let identity = record.identity();
        match self.by_identity.get(&identity) {
            Some(&seq) => {
                self.order.insert(seq, record);
                PutOutcome::Updated
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.order.insert(seq, record);
                self.by_identity.insert(identity, seq);
                PutOutcome::Added
            }
        }
    }

    fn remove(&mut self, identity: &KeyIdentity) -> Option<KeyRecord> {
        let seq = self.by_identity.remove(identity)?;
        self.order.remove(&seq)
    }

    fn records(&self) -> impl Iterator<Item = &KeyRecord> {
        self.order.values()
    }

    fn to_stored(&self) -> Vec<StoredKey> {
        self.records().map(StoredKey::from).collect()
    }
}

/// A consistent read-only view of managed and external keys
#[derive(Debug, Clone)]
pub struct RegistryView {
    managed: Arc<ManagedKeys>,
    external: Arc<ExternalSnapshot>,
}

impl RegistryView {
    /// Generation of the external snapshot in this view
    pub fn external_generation(&self) -> u64 {
        self.external.generation()
    }

    pub fn get(&self, key_id: &str, kind: KeyKind) -> Option<&KeyRecord> {
        let identity = KeyIdentity::new(key_id, kind);
        self.managed
            .get(&identity)
            .or_else(|| self.external.get(&identity))
    }

    /// Managed records in registration order, then external records in
    /// scan order. External records shadowed by a managed one are left
    /// out.
    pub fn list_all(&self) -> Vec<&KeyRecord> {
        self.managed
            .records()
            .chain(
                self.external
                    .records()
                    .iter()
                    .filter(|r| !self.managed.contains(&r.identity())),
            )
            .collect()
    }

    pub fn list_by_kind(&self, kind: KeyKind) -> Vec<&KeyRecord> {
        self.list_all()
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect()
    }

    /// Summaries partitioned by origin
    pub fn listing(&self) -> KeyListing {
        let mut listing = KeyListing::default();
        for record in self.list_all() {
            match record.origin {
                KeyOrigin::Managed => listing.managed.push(record.summary()),
                KeyOrigin::External(_) => listing.external.push(record.summary()),
            }
        }
        listing
    }
}

/// Registry of managed and external keys
pub struct KeyRegistry {
    state: Arc<dyn StateStore>,
    secrets: Arc<dyn SecretStore>,
    external: Arc<ExternalKeyLoader>,
    managed: RwLock<Arc<ManagedKeys>>,
    /// Serializes mutate-then-persist sequences
    write_lock: Mutex<()>,
}

impl KeyRegistry {
    /// Open the registry, restoring managed keys from the state store.
    /// Entries that cannot be decoded are logged and skipped.
    pub async fn open(
        state: Arc<dyn StateStore>,
        secrets: Arc<dyn SecretStore>,
        external: Arc<ExternalKeyLoader>,
    ) -> Result<Self> {
        let mut managed = ManagedKeys::default();

        match state.get(KEYS_STATE_KEY).await? {
            Some(Value::Array(entries)) => {
                for (i, entry) in entries.into_iter().enumerate() {
                    match serde_json::from_value::<StoredKey>(entry) {
                        Ok(stored) => {
                            managed.insert(KeyRecord::from(stored));
                        }
                        Err(e) => warn!("Skipping corrupt stored key #{}: {}", i, e),
                    }
                }
            }
            Some(other) => warn!(
                "Ignoring stored key list of unexpected type: {}",
                json_type(&other)
            ),
            None => debug!("No stored keys"),
        }

        info!("Restored {} managed keys", managed.order.len());

        Ok(Self {
            state,
            secrets,
            external,
            managed: RwLock::new(Arc::new(managed)),
            write_lock: Mutex::new(()),
        })
    }

    /// The loader feeding the external overlay
    pub fn external(&self) -> &Arc<ExternalKeyLoader> {
        &self.external
    }

    /// Snapshot of managed keys and the current external overlay
    pub async fn view(&self) -> RegistryView {
        RegistryView {
            managed: self.managed.read().await.clone(),
            external: self.external.current_snapshot(),
        }
    }

    /// Like [`view`](Self::view), but first waits for a reload in progress
    pub async fn settled_view(&self) -> RegistryView {
        let external = self.external.settled().await;
        RegistryView {
            managed: self.managed.read().await.clone(),
            external,
        }
    }

    /// Add or replace a managed record. The record is stored as managed
    /// whatever its origin.
    pub async fn put(&self, mut record: KeyRecord) -> Result<PutOutcome> {
        record.origin = KeyOrigin::Managed;
        let identity = record.identity();

        let _guard = self.write_lock.lock().await;
        let mut next = (**self.managed.read().await).clone();
        let outcome = next.insert(record);

        self.persist(&next).await?;
        *self.managed.write().await = Arc::new(next);

        match outcome {
            PutOutcome::Added => info!("Imported key {}", identity),
            PutOutcome::Updated => info!("Updated key {}", identity),
        }
        Ok(outcome)
    }

    pub async fn get(&self, key_id: &str, kind: KeyKind) -> Option<KeyRecord> {
        self.view().await.get(key_id, kind).cloned()
    }

    /// Remove a managed record.
    ///
    /// Returns `Ok(false)` when nothing has that identity and
    /// `ImmutableKeyRemoval` when only an external record does. Removing a
    /// private key also forgets its remembered passphrase.
    pub async fn remove(&self, key_id: &str, kind: KeyKind) -> Result<bool> {
        let identity = KeyIdentity::new(key_id, kind);

        let _guard = self.write_lock.lock().await;
        let mut next = (**self.managed.read().await).clone();

        if next.remove(&identity).is_none() {
            if self.external.current_snapshot().contains(&identity) {
                return Err(CipherpadError::ImmutableKeyRemoval(identity.to_string()));
            }
            return Ok(false);
        }

        self.persist(&next).await?;
        *self.managed.write().await = Arc::new(next);
        info!("Removed key {}", identity);

        if kind == KeyKind::Private {
            if let Err(e) = self.secrets.delete(&passphrase_entry_id(key_id)).await {
                warn!("Could not delete stored passphrase for {}: {}", key_id, e);
            }
        }

        Ok(true)
    }

    pub async fn list_by_kind(&self, kind: KeyKind) -> Vec<KeyRecord> {
        let view = self.view().await;
        view.list_by_kind(kind).into_iter().cloned().collect()
    }

    pub async fn list_all(&self) -> Vec<KeyRecord> {
        let view = self.view().await;
        view.list_all().into_iter().cloned().collect()
    }

    /// The persisted default recipient, if any. It may refer to a key that
    /// no longer exists.
    pub async fn default_recipient(&self) -> Result<Option<String>> {
        Ok(self
            .state
            .get(DEFAULT_RECIPIENT_STATE_KEY)
            .await?
            .and_then(|value| value.as_str().map(str::to_string))
            .filter(|id| !id.is_empty()))
    }

    pub async fn set_default_recipient(&self, key_id: Option<&str>) -> Result<()> {
        let value = key_id.map_or(Value::Null, |id| Value::String(id.to_string()));
        self.state.set(DEFAULT_RECIPIENT_STATE_KEY, value).await?;
        match key_id {
            Some(id) => info!("Default recipient set to {}", id),
            None => info!("Default recipient cleared"),
        }
        Ok(())
    }

    async fn persist(&self, managed: &ManagedKeys) -> Result<()> {
        let value = serde_json::to_value(managed.to_stored())?;
        self.state.set(KEYS_STATE_KEY, value).await
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
