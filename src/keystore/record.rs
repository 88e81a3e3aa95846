//! Key records and their identities
//!
//! A key is identified by the pair `(key_id, kind)`: the public and the
//! private half of one key share a fingerprint but are distinct records.

use crate::errors::{CipherpadError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Which half of a key pair a record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Public,
    Private,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Public => "public",
            KeyKind::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "public" | "pub" => Ok(KeyKind::Public),
            "private" | "secret" | "sec" => Ok(KeyKind::Private),
            _ => Err(CipherpadError::InvalidKeyFormat(format!(
                "Unknown key kind: {}",
                s
            ))),
        }
    }

    /// The other half of the pair
    pub fn counterpart(&self) -> Self {
        match self {
            KeyKind::Public => KeyKind::Private,
            KeyKind::Private => KeyKind::Public,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyOrigin {
    /// Imported or generated, owned and persisted by the registry
    Managed,
    /// Loaded from a configured path; read-only and never persisted
    External(PathBuf),
}

/// Composite identity of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyIdentity {
    pub key_id: String,
    pub kind: KeyKind,
}

impl KeyIdentity {
    pub fn new(key_id: impl Into<String>, kind: KeyKind) -> Self {
        Self {
            key_id: key_id.into(),
            kind,
        }
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key_id, self.kind)
    }
}

/// A public or private key held by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub key_id: String,
    pub user_id: String,
    pub kind: KeyKind,
    /// Armored key text
    pub material: String,
    pub origin: KeyOrigin,
}

impl KeyRecord {
    pub fn managed(
        key_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: KeyKind,
        material: impl Into<String>,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            user_id: user_id.into(),
            kind,
            material: material.into(),
            origin: KeyOrigin::Managed,
        }
    }

    pub fn identity(&self) -> KeyIdentity {
        KeyIdentity::new(self.key_id.clone(), self.kind)
    }

    pub fn is_external(&self) -> bool {
        matches!(self.origin, KeyOrigin::External(_))
    }

    pub fn summary(&self) -> KeySummary {
        KeySummary {
            key_id: self.key_id.clone(),
            user_id: self.user_id.clone(),
            kind: self.kind,
            source: match &self.origin {
                KeyOrigin::Managed => None,
                KeyOrigin::External(path) => Some(path.clone()),
            },
        }
    }
}

/// Key metadata without the armored material
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySummary {
    pub key_id: String,
    pub user_id: String,
    pub kind: KeyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

/// All known keys, partitioned by origin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyListing {
    pub managed: Vec<KeySummary>,
    pub external: Vec<KeySummary>,
}

/// Persisted form of a managed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKey {
    pub key_id: String,
    pub user_id: String,
    pub kind: KeyKind,
    pub armored_key: String,
}

impl From<&KeyRecord> for StoredKey {
    fn from(record: &KeyRecord) -> Self {
        Self {
            key_id: record.key_id.clone(),
            user_id: record.user_id.clone(),
            kind: record.kind,
            armored_key: record.material.clone(),
        }
    }
}

impl From<StoredKey> for KeyRecord {
    fn from(stored: StoredKey) -> Self {
        KeyRecord::managed(
            stored.key_id,
            stored.user_id,
            stored.kind,
            stored.armored_key,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!(KeyKind::parse("Public").unwrap(), KeyKind::Public);
        assert_eq!(KeyKind::parse("secret").unwrap(), KeyKind::Private);
        assert!(KeyKind::parse("symmetric").is_err());
        assert_eq!(KeyKind::Public.counterpart(), KeyKind::Private);
    }

    #[test]
    fn test_same_id_different_kind_are_distinct_identities() {
        let public = KeyRecord::managed("ABCD", "Alice", KeyKind::Public, "pub");
        let private = KeyRecord::managed("ABCD", "Alice", KeyKind::Private, "sec");
        assert_ne!(public.identity(), private.identity());
    }

    #[test]
    fn test_stored_key_serializes_camel_case() {
        let record = KeyRecord::managed("ABCD", "Alice", KeyKind::Private, "armor");
        let json = serde_json::to_value(StoredKey::from(&record)).unwrap();
        assert_eq!(json["keyId"], "ABCD");
        assert_eq!(json["kind"], "private");
        assert_eq!(json["armoredKey"], "armor");
    }

    #[test]
    fn test_summary_carries_external_source() {
        let record = KeyRecord {
            origin: KeyOrigin::External(PathBuf::from("/keys/team.asc")),
            ..KeyRecord::managed("ABCD", "Team", KeyKind::Public, "pub")
        };
        assert!(record.is_external());
        assert_eq!(
            record.summary().source,
            Some(PathBuf::from("/keys/team.asc"))
        );
    }
}
