//! Configuration management for cipherpad
//!
//! Supports loading configuration from:
//! - Built-in defaults
//! - Config file (cipherpad.toml, /etc/cipherpad/config, or `--config`)
//! - Environment variables (CIPHERPAD_*, `__` between section and field)

use crate::crypto::KdfParams;
use crate::errors::{CipherpadError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration
    pub storage: StorageConfig,

    /// Key handling configuration
    pub keys: KeysConfig,

    /// Security configuration
    pub security: SecurityConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Which secret store backs remembered passphrases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretStoreKind {
    /// Encrypted files under `storage.secrets_path`
    Encrypted,
    /// Process memory only
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding managed keys and settings
    pub state_path: PathBuf,

    /// Directory of encrypted secret entries
    pub secrets_path: PathBuf,

    pub secret_store: SecretStoreKind,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("./data/state.json"),
            secrets_path: PathBuf::from("./data/secrets"),
            secret_store: SecretStoreKind::Encrypted,
        }
    }
}

/// Key handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Files and directories scanned for external keys
    pub external_paths: Vec<PathBuf>,

    /// Recipient used for writes when none is given. Seeds the persisted
    /// setting if that is unset.
    pub default_recipient: Option<String>,

    /// Prompt for passphrases that are not stored
    pub prompt_for_passphrase: bool,

    /// Store prompted passphrases in the secret store
    pub remember_passphrase: bool,

    /// Warn when writing for a recipient whose private key is unknown
    pub warn_if_no_private_key: bool,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            external_paths: Vec::new(),
            default_recipient: None,
            prompt_for_passphrase: true,
            remember_passphrase: false,
            warn_if_no_private_key: true,
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Argon2id memory cost in KiB
    pub kdf_memory_kib: u32,

    /// Argon2id iterations
    pub kdf_iterations: u32,

    /// Argon2id lanes
    pub kdf_parallelism: u32,

    /// Environment variable holding the secret store master password
    pub master_password_env: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        let kdf = KdfParams::default();
        Self {
            kdf_memory_kib: kdf.memory_kib,
            kdf_iterations: kdf.iterations,
            kdf_parallelism: kdf.parallelism,
            master_password_env: "CIPHERPAD_MASTER_PASSWORD".to_string(),
        }
    }
}

impl SecurityConfig {
    pub fn kdf(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.kdf_memory_kib,
            iterations: self.kdf_iterations,
            parallelism: self.kdf_parallelism,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Start with defaults
        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        } else {
            // Try default locations
            builder = builder
                .add_source(config::File::with_name("cipherpad").required(false))
                .add_source(config::File::with_name("/etc/cipherpad/config").required(false));
        }

        // Load from environment (CIPHERPAD_KEYS__EXTERNAL_PATHS=a,b etc.)
        builder = builder.add_source(
            config::Environment::with_prefix("CIPHERPAD")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("keys.external_paths")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| CipherpadError::ConfigError(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| CipherpadError::ConfigError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.secret_store == SecretStoreKind::Encrypted
            && self.storage.secrets_path.as_os_str().is_empty()
        {
            return Err(CipherpadError::ConfigError(
                "Encrypted secret store enabled but secrets_path not specified".to_string(),
            ));
        }

        if self.security.kdf_iterations == 0 || self.security.kdf_parallelism == 0 {
            return Err(CipherpadError::ConfigError(
                "kdf_iterations and kdf_parallelism must be at least 1".to_string(),
            ));
        }

        // Argon2 needs 8 KiB per lane
        if self.security.kdf_memory_kib < 8 * self.security.kdf_parallelism {
            return Err(CipherpadError::ConfigError(format!(
                "kdf_memory_kib must be at least {}",
                8 * self.security.kdf_parallelism
            )));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(CipherpadError::ConfigError(format!(
                "Unknown log format: {}",
                self.logging.format
            )));
        }

        for path in &self.keys.external_paths {
            if !path.exists() {
                info!("External key path does not exist yet: {:?}", path);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.secret_store, SecretStoreKind::Encrypted);
        assert!(config.keys.prompt_for_passphrase);
        assert!(!config.keys.remember_passphrase);
        assert_eq!(config.security.kdf(), KdfParams::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cipherpad.toml");
        fs::write(
            &path,
            r#"
[storage]
secret_store = "memory"

[keys]
external_paths = ["/srv/keys", "/home/me/keys/team.asc"]
default_recipient = "ABCD"
remember_passphrase = true

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config.storage.secret_store, SecretStoreKind::Memory);
        assert_eq!(
            config.keys.external_paths,
            vec![
                PathBuf::from("/srv/keys"),
                PathBuf::from("/home/me/keys/team.asc")
            ]
        );
        assert_eq!(config.keys.default_recipient.as_deref(), Some("ABCD"));
        assert!(config.keys.remember_passphrase);
        // Untouched sections keep their defaults
        assert!(config.keys.warn_if_no_private_key);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            Config::load(path.to_str()),
            Err(CipherpadError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.security.kdf_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.secrets_path = PathBuf::new();
        assert!(config.validate().is_err());
        config.storage.secret_store = SecretStoreKind::Memory;
        assert!(config.validate().is_ok());
    }
}
