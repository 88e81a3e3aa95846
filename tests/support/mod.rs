//! Shared helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use cipherpad::access::AccessSettings;
use cipherpad::crypto::{GeneratedKey, KdfParams, KeyCipher, ParsedKey, SealedBoxCipher};
use cipherpad::keystore::{
    ExternalKeyLoader, KeyRegistry, MemorySecretStore, MemoryStateStore, SecretStore,
};
use cipherpad::{DecryptFailure, EncryptedAccess, KeyKind, Prompter, Result, SecureBytes, SecureString};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Argon2 parameters cheap enough for tests
pub fn fast_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

/// Sealed-box cipher that records which private keys it was asked to
/// decrypt with.
pub struct CountingCipher {
    inner: SealedBoxCipher,
    attempts: Mutex<Vec<String>>,
}

impl CountingCipher {
    pub fn new() -> Self {
        Self {
            inner: SealedBoxCipher::new(fast_kdf()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Key ids of every decryption attempt, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyCipher for CountingCipher {
    fn parse_key(&self, armored: &str, kind: KeyKind) -> Result<ParsedKey> {
        self.inner.parse_key(armored, kind)
    }

    fn is_passphrase_protected(&self, private_armor: &str) -> Result<bool> {
        self.inner.is_passphrase_protected(private_armor)
    }

    fn public_from_private(&self, private_armor: &str) -> Result<String> {
        self.inner.public_from_private(private_armor)
    }

    async fn generate(
        &self,
        user_id: &str,
        passphrase: Option<&SecureString>,
    ) -> Result<GeneratedKey> {
        self.inner.generate(user_id, passphrase).await
    }

    async fn encrypt(&self, plaintext: &[u8], public_armor: &str) -> Result<Vec<u8>> {
        self.inner.encrypt(plaintext, public_armor).await
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        private_armor: &str,
        secret: Option<&SecureString>,
    ) -> std::result::Result<SecureBytes, DecryptFailure> {
        let key_id = self
            .inner
            .parse_key(private_armor, KeyKind::Private)
            .map(|parsed| parsed.key_id)
            .unwrap_or_default();
        self.attempts.lock().unwrap().push(key_id);
        self.inner.decrypt(ciphertext, private_armor, secret).await
    }
}

/// Prompter answering from a script
#[derive(Default)]
pub struct ScriptedPrompter {
    secrets: Mutex<VecDeque<Option<String>>>,
    selection: Mutex<Option<usize>>,
    secret_prompts: Mutex<Vec<String>>,
    selections: Mutex<usize>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer for the next secret prompt; `None` cancels
    pub fn answer_secret(&self, answer: Option<&str>) {
        self.secrets
            .lock()
            .unwrap()
            .push_back(answer.map(str::to_string));
    }

    pub fn answer_selection(&self, index: Option<usize>) {
        *self.selection.lock().unwrap() = index;
    }

    /// Labels of every secret prompt shown
    pub fn secret_prompts(&self) -> Vec<String> {
        self.secret_prompts.lock().unwrap().clone()
    }

    pub fn selection_count(&self) -> usize {
        *self.selections.lock().unwrap()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn prompt_secret(&self, label: &str) -> Result<Option<SecureString>> {
        self.secret_prompts.lock().unwrap().push(label.to_string());
        let answer = self.secrets.lock().unwrap().pop_front().flatten();
        Ok(answer.map(SecureString::from))
    }

    async fn select_one(&self, _options: &[String], _label: &str) -> Result<Option<usize>> {
        *self.selections.lock().unwrap() += 1;
        Ok(*self.selection.lock().unwrap())
    }
}

/// An [`EncryptedAccess`] over in-memory stores with a scratch directory
pub struct Harness {
    pub access: EncryptedAccess,
    pub cipher: Arc<CountingCipher>,
    pub prompter: Arc<ScriptedPrompter>,
    pub secrets: Arc<MemorySecretStore>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(AccessSettings::default()).await
    }

    pub async fn with_settings(settings: AccessSettings) -> Self {
        let cipher = Arc::new(CountingCipher::new());
        let prompter = Arc::new(ScriptedPrompter::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let loader = Arc::new(ExternalKeyLoader::new(cipher.clone()));
        let registry = KeyRegistry::open(
            Arc::new(MemoryStateStore::new()),
            secrets.clone(),
            loader,
        )
        .await
        .expect("registry opens");

        let access = EncryptedAccess::new(
            Arc::new(registry),
            cipher.clone(),
            secrets.clone() as Arc<dyn SecretStore>,
            prompter.clone(),
            settings,
        );

        Self {
            access,
            cipher,
            prompter,
            secrets,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Generate a key outside the registry
    pub async fn loose_key(&self, user_id: &str, passphrase: Option<&str>) -> GeneratedKey {
        let passphrase = passphrase.map(SecureString::from);
        self.cipher
            .generate(user_id, passphrase.as_ref())
            .await
            .expect("key generation")
    }
}
