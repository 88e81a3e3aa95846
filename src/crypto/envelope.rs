//! Cryptographic envelope
//!
//! [`KeyCipher`] is the boundary between the key engine and whatever
//! performs the actual public-key cryptography. The engine only ever asks
//! it to parse key blocks, encrypt for a public key and attempt a
//! decryption with a private key.
//!
//! [`SealedBoxCipher`] is the bundled backend: X25519 + XSalsa20-Poly1305
//! sealed boxes wrapped in PGP-style armor, with private keys optionally
//! protected by a passphrase (Argon2id -> AES-256-GCM).

use crate::crypto::armor::{self, BlockKind};
use crate::crypto::kdf::{KdfParams, SealedSecret};
use crate::errors::{CipherpadError, DecryptFailure, Result};
use crate::keystore::KeyKind;
use crate::security::{SecureBytes, SecureString};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

/// Packet format version
const PACKET_VERSION: u32 = 1;

/// Armor header carrying the key's user id
const USER_ID_HEADER: &str = "User-Id";

/// Identity of a parsed key block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub key_id: String,
    pub user_id: String,
    pub kind: KeyKind,
}

/// Both halves of a freshly generated key
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub key_id: String,
    pub user_id: String,
    pub public_armor: String,
    pub private_armor: String,
}

/// Public-key operations consumed by the key engine
#[async_trait]
pub trait KeyCipher: Send + Sync {
    /// Parse a single armored key block of the given kind
    fn parse_key(&self, armored: &str, kind: KeyKind) -> Result<ParsedKey>;

    /// Whether unlocking the private key requires a passphrase
    fn is_passphrase_protected(&self, private_armor: &str) -> Result<bool>;

    /// Armored public half of a private key
    fn public_from_private(&self, private_armor: &str) -> Result<String>;

    async fn generate(&self, user_id: &str, passphrase: Option<&SecureString>)
        -> Result<GeneratedKey>;

    async fn encrypt(&self, plaintext: &[u8], public_armor: &str) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext` with a private key. Either the whole plaintext
    /// is returned or nothing is.
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        private_armor: &str,
        secret: Option<&SecureString>,
    ) -> std::result::Result<SecureBytes, DecryptFailure>;
}

/// Parse a key block found in a file. The armor markers decide the kind;
/// a block whose body only parses as the other kind is accepted as such.
pub fn parse_block(cipher: &dyn KeyCipher, block: &armor::KeyBlock<'_>) -> Result<ParsedKey> {
    match cipher.parse_key(block.text, block.kind) {
        Ok(parsed) => Ok(parsed),
        Err(primary) => match cipher.parse_key(block.text, block.kind.counterpart()) {
            Ok(parsed) => {
                debug!("Key block labelled {} parsed as {}", block.kind, parsed.kind);
                Ok(parsed)
            }
            Err(_) => Err(primary),
        },
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PublicKeyPacket {
    version: u32,
    /// X25519 public key (base64)
    public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "protection", rename_all = "snake_case")]
enum SecretProtection {
    Clear { secret_key: String },
    Passphrase { sealed: SealedSecret },
}

#[derive(Debug, Serialize, Deserialize)]
struct PrivateKeyPacket {
    version: u32,
    public_key: String,
    #[serde(flatten)]
    secret: SecretProtection,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessagePacket {
    version: u32,
    /// Key id of the public key the message was sealed for
    recipient: String,
    ephemeral_public_key: String,
    nonce: String,
    ciphertext: String,
}

/// Fingerprint of an X25519 public key: first 20 bytes of its SHA-256,
/// upper-case hex.
pub fn key_id_for(public: &PublicKey) -> String {
    let digest = Sha256::digest(public.as_bytes());
    hex::encode_upper(&digest[..20])
}

fn decode_key32(encoded: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD.decode(encoded)?;
    bytes.as_slice().try_into().map_err(|_| {
        CipherpadError::InvalidKeyFormat(format!("Expected 32 key bytes, got {}", bytes.len()))
    })
}

fn user_id_of(armor: &armor::Armor) -> String {
    armor
        .header(USER_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| "<unknown>".to_string())
}

/// Sealed-box backend for [`KeyCipher`]
#[derive(Debug, Clone, Default)]
pub struct SealedBoxCipher {
    kdf: KdfParams,
}

impl SealedBoxCipher {
    /// Create a cipher protecting newly generated keys with `kdf`
    pub fn new(kdf: KdfParams) -> Self {
        Self { kdf }
    }

    fn read_public(&self, public_armor: &str) -> Result<(armor::Armor, PublicKey)> {
        let armor = armor::decode(public_armor, BlockKind::PublicKey)?;
        let packet: PublicKeyPacket = serde_json::from_slice(&armor.body)
            .map_err(|e| CipherpadError::InvalidKeyFormat(e.to_string()))?;
        let public = PublicKey::from(decode_key32(&packet.public_key)?);
        Ok((armor, public))
    }

    fn read_private(&self, private_armor: &str) -> Result<(armor::Armor, PrivateKeyPacket)> {
        let armor = armor::decode(private_armor, BlockKind::PrivateKey)?;
        let packet: PrivateKeyPacket = serde_json::from_slice(&armor.body)
            .map_err(|e| CipherpadError::InvalidKeyFormat(e.to_string()))?;
        if packet.version != PACKET_VERSION {
            return Err(CipherpadError::InvalidKeyFormat(format!(
                "Unsupported key version {}",
                packet.version
            )));
        }
        Ok((armor, packet))
    }

    fn armor_public(user_id: &str, public: &PublicKey) -> Result<String> {
        let packet = PublicKeyPacket {
            version: PACKET_VERSION,
            public_key: STANDARD.encode(public.as_bytes()),
        };
        let body = serde_json::to_vec(&packet)?;
        Ok(armor::encode(
            BlockKind::PublicKey,
            &[(USER_ID_HEADER, user_id)],
            &body,
        ))
    }

    fn generate_blocking(
        kdf: KdfParams,
        user_id: String,
        passphrase: Option<SecureString>,
    ) -> Result<GeneratedKey> {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        let key_id = key_id_for(&public);
        let secret_bytes = Zeroizing::new(secret.to_bytes());

        let protection = match passphrase.filter(|p| !p.is_empty()) {
            Some(passphrase) => SecretProtection::Passphrase {
                sealed: SealedSecret::seal(&secret_bytes[..], passphrase.expose(), kdf)?,
            },
            None => SecretProtection::Clear {
                secret_key: STANDARD.encode(&secret_bytes[..]),
            },
        };

        let packet = PrivateKeyPacket {
            version: PACKET_VERSION,
            public_key: STANDARD.encode(public.as_bytes()),
            secret: protection,
        };
        let body = Zeroizing::new(serde_json::to_vec(&packet)?);
        let private_armor = armor::encode(
            BlockKind::PrivateKey,
            &[(USER_ID_HEADER, user_id.as_str())],
            &body,
        );
        let public_armor = Self::armor_public(&user_id, &public)?;

        Ok(GeneratedKey {
            key_id,
            user_id,
            public_armor,
            private_armor,
        })
    }

    fn open_blocking(
        ciphertext: &[u8],
        private_armor: &str,
        secret: Option<&SecureString>,
    ) -> std::result::Result<SecureBytes, DecryptFailure> {
        let text = std::str::from_utf8(ciphertext).map_err(|_| DecryptFailure::Malformed)?;
        let message_armor =
            armor::decode(text, BlockKind::Message).map_err(|_| DecryptFailure::Malformed)?;
        let message: MessagePacket =
            serde_json::from_slice(&message_armor.body).map_err(|_| DecryptFailure::Malformed)?;

        let armor = armor::decode(private_armor, BlockKind::PrivateKey)
            .map_err(|_| DecryptFailure::Malformed)?;
        let packet: PrivateKeyPacket =
            serde_json::from_slice(&armor.body).map_err(|_| DecryptFailure::Malformed)?;

        let public = PublicKey::from(
            decode_key32(&packet.public_key).map_err(|_| DecryptFailure::Malformed)?,
        );
        if key_id_for(&public) != message.recipient {
            return Err(DecryptFailure::KeyMismatch);
        }

        let secret_bytes: Zeroizing<Vec<u8>> = match &packet.secret {
            SecretProtection::Clear { secret_key } => Zeroizing::new(
                STANDARD
                    .decode(secret_key)
                    .map_err(|_| DecryptFailure::Malformed)?,
            ),
            SecretProtection::Passphrase { sealed } => {
                let passphrase = secret.map(SecureString::expose).unwrap_or_default();
                sealed.open(passphrase)?
            }
        };
        let secret_array: [u8; 32] = secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| DecryptFailure::Malformed)?;
        let secret_key = SecretKey::from(secret_array);

        let ephemeral = PublicKey::from(
            decode_key32(&message.ephemeral_public_key).map_err(|_| DecryptFailure::Malformed)?,
        );
        let nonce = STANDARD
            .decode(&message.nonce)
            .map_err(|_| DecryptFailure::Malformed)?;
        if nonce.len() != 24 {
            return Err(DecryptFailure::Malformed);
        }
        let sealed = STANDARD
            .decode(&message.ciphertext)
            .map_err(|_| DecryptFailure::Malformed)?;

        let salsa_box = SalsaBox::new(&ephemeral, &secret_key);
        salsa_box
            .decrypt(crypto_box::Nonce::from_slice(&nonce), sealed.as_slice())
            .map(SecureBytes::new)
            .map_err(|_| DecryptFailure::Malformed)
    }
}

#[async_trait]
impl KeyCipher for SealedBoxCipher {
    fn parse_key(&self, armored: &str, kind: KeyKind) -> Result<ParsedKey> {
        let (armor, public) = match kind {
            KeyKind::Public => self.read_public(armored)?,
            KeyKind::Private => {
                let (armor, packet) = self.read_private(armored)?;
                let public = PublicKey::from(decode_key32(&packet.public_key)?);
                (armor, public)
            }
        };

        Ok(ParsedKey {
            key_id: key_id_for(&public),
            user_id: user_id_of(&armor),
            kind,
        })
    }

    fn is_passphrase_protected(&self, private_armor: &str) -> Result<bool> {
        let (_, packet) = self.read_private(private_armor)?;
        Ok(matches!(packet.secret, SecretProtection::Passphrase { .. }))
    }

    fn public_from_private(&self, private_armor: &str) -> Result<String> {
        let (armor, packet) = self.read_private(private_armor)?;
        let public = PublicKey::from(decode_key32(&packet.public_key)?);
        Self::armor_public(&user_id_of(&armor), &public)
    }

    async fn generate(
        &self,
        user_id: &str,
        passphrase: Option<&SecureString>,
    ) -> Result<GeneratedKey> {
        let kdf = self.kdf;
        let user_id = user_id.to_string();
        let passphrase = passphrase.cloned();

        tokio::task::spawn_blocking(move || Self::generate_blocking(kdf, user_id, passphrase))
            .await
            .map_err(|e| CipherpadError::InternalError(e.to_string()))?
    }

    async fn encrypt(&self, plaintext: &[u8], public_armor: &str) -> Result<Vec<u8>> {
        let (_, recipient) = self.read_public(public_armor)?;

        let ephemeral = SecretKey::generate(&mut OsRng);
        let salsa_box = SalsaBox::new(&recipient, &ephemeral);

        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);

        let sealed = salsa_box
            .encrypt(crypto_box::Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CipherpadError::EncryptionFailed(format!("seal failed: {e}")))?;

        let packet = MessagePacket {
            version: PACKET_VERSION,
            recipient: key_id_for(&recipient),
            ephemeral_public_key: STANDARD.encode(ephemeral.public_key().as_bytes()),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(sealed),
        };
        let body = serde_json::to_vec(&packet)?;

        debug!("Encrypted {} bytes for {}", plaintext.len(), packet.recipient);
        Ok(armor::encode(BlockKind::Message, &[], &body).into_bytes())
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        private_armor: &str,
        secret: Option<&SecureString>,
    ) -> std::result::Result<SecureBytes, DecryptFailure> {
        let ciphertext = ciphertext.to_vec();
        let private_armor = private_armor.to_string();
        let secret = secret.cloned();

        tokio::task::spawn_blocking(move || {
            Self::open_blocking(&ciphertext, &private_armor, secret.as_ref())
        })
        .await
        .map_err(|_| DecryptFailure::Unknown)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::test_kdf;
    use proptest::prelude::*;

    fn cipher() -> SealedBoxCipher {
        SealedBoxCipher::new(test_kdf())
    }

    #[tokio::test]
    async fn test_generate_and_parse() {
        let cipher = cipher();
        let key = cipher.generate("Alice <alice@example.com>", None).await.unwrap();

        let public = cipher.parse_key(&key.public_armor, KeyKind::Public).unwrap();
        let private = cipher.parse_key(&key.private_armor, KeyKind::Private).unwrap();

        assert_eq!(public.key_id, key.key_id);
        assert_eq!(private.key_id, key.key_id);
        assert_eq!(public.user_id, "Alice <alice@example.com>");
        assert_eq!(key.key_id.len(), 40);
        assert!(!cipher.is_passphrase_protected(&key.private_armor).unwrap());
    }

    #[tokio::test]
    async fn test_parse_with_wrong_kind_fails() {
        let cipher = cipher();
        let key = cipher.generate("Bob", None).await.unwrap();
        assert!(cipher.parse_key(&key.public_armor, KeyKind::Private).is_err());
        assert!(cipher.parse_key(&key.private_armor, KeyKind::Public).is_err());
    }

    #[tokio::test]
    async fn test_public_from_private_matches() {
        let cipher = cipher();
        let key = cipher.generate("Carol", None).await.unwrap();
        let derived = cipher.public_from_private(&key.private_armor).unwrap();
        assert_eq!(derived, key.public_armor);
    }

    #[tokio::test]
    async fn test_round_trip_with_passphrase() {
        let cipher = cipher();
        let passphrase = SecureString::from("x");
        let key = cipher.generate("Dave", Some(&passphrase)).await.unwrap();
        assert!(cipher.is_passphrase_protected(&key.private_armor).unwrap());

        let ciphertext = cipher.encrypt(b"hello", &key.public_armor).await.unwrap();
        let plaintext = cipher
            .decrypt(&ciphertext, &key.private_armor, Some(&passphrase))
            .await
            .unwrap();
        assert_eq!(plaintext.expose(), b"hello");
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_distinguished() {
        let cipher = cipher();
        let key = cipher
            .generate("Erin", Some(&SecureString::from("right")))
            .await
            .unwrap();
        let ciphertext = cipher.encrypt(b"data", &key.public_armor).await.unwrap();

        let wrong = SecureString::from("wrong");
        let result = cipher
            .decrypt(&ciphertext, &key.private_armor, Some(&wrong))
            .await;
        assert_eq!(result.unwrap_err(), DecryptFailure::WrongSecret);

        let missing = cipher.decrypt(&ciphertext, &key.private_armor, None).await;
        assert_eq!(missing.unwrap_err(), DecryptFailure::WrongSecret);
    }

    #[tokio::test]
    async fn test_other_recipient_is_key_mismatch() {
        let cipher = cipher();
        let alice = cipher.generate("Alice", None).await.unwrap();
        let bob = cipher.generate("Bob", None).await.unwrap();
        let ciphertext = cipher.encrypt(b"for bob", &bob.public_armor).await.unwrap();

        let result = cipher.decrypt(&ciphertext, &alice.private_armor, None).await;
        assert_eq!(result.unwrap_err(), DecryptFailure::KeyMismatch);
    }

    #[tokio::test]
    async fn test_plaintext_input_is_malformed() {
        let cipher = cipher();
        let key = cipher.generate("Frank", None).await.unwrap();
        let result = cipher.decrypt(b"not encrypted", &key.private_armor, None).await;
        assert_eq!(result.unwrap_err(), DecryptFailure::Malformed);
    }

    #[tokio::test]
    async fn test_round_trip_edge_contents() {
        let cipher = cipher();
        let key = cipher.generate("Grace", None).await.unwrap();

        let tricky = format!(
            "{}\n{}\n{}",
            armor::PRIVATE_KEY_BEGIN,
            armor::MESSAGE_END,
            armor::PUBLIC_KEY_END
        );
        for content in [Vec::new(), tricky.into_bytes(), vec![0u8, 255, 10, 13]] {
            let ciphertext = cipher.encrypt(&content, &key.public_armor).await.unwrap();
            let plaintext = cipher
                .decrypt(&ciphertext, &key.private_armor, None)
                .await
                .unwrap();
            assert_eq!(plaintext.expose(), content.as_slice());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_round_trip(content in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let cipher = cipher();
                let key = cipher.generate("Prop", None).await.unwrap();
                let ciphertext = cipher.encrypt(&content, &key.public_armor).await.unwrap();
                let plaintext = cipher
                    .decrypt(&ciphertext, &key.private_armor, None)
                    .await
                    .unwrap();
                prop_assert_eq!(plaintext.expose(), content.as_slice());
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
