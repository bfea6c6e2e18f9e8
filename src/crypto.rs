//! # Payload Sealing for Log Messages
//!
//! Every packet put on the log is compressed with Zstd (level 1) and encrypted
//! with AES-256-GCM under a key derived from the cluster's shared secret.
//!
//! ## Sealed Format
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────┐
//! │ nonce (12 B) │ AES-GCM(Zstd(packet), aad = envelope)│
//! └──────────────┴──────────────────────────────────────┘
//! ```
//!
//! ## Key Management
//!
//! The shared secret comes from a [`KeyProvider`]. Per-message keys are
//! derived with HKDF-SHA256 from the secret and the message nonce, so two
//! messages never share a key even if their plaintexts are equal.
//!
//! ## Security Properties
//!
//! - **Confidentiality**: AES-256-GCM encryption
//! - **Integrity**: GCM authentication tag over payload and envelope
//! - **Binding**: a payload cannot be replayed under another envelope

use std::env;
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

use crate::envelope::MessageEnvelope;
use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// AES-256 key size in bytes.
pub const AES256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits).
pub const AES_GCM_NONCE_SIZE: usize = 12;

/// Zstd compression level (1 = fastest).
pub const ZSTD_COMPRESSION_LEVEL: i32 = 1;

/// Environment variable holding the cluster's shared secret.
pub const SHARED_SECRET_ENV_VAR: &str = "CLUSTERDB_SHARED_SECRET";

/// HKDF info prefix, so keys derived here never collide with other uses of
/// the same secret.
const KEY_CONTEXT: &[u8] = b"clusterdb-message-v1";

// =============================================================================
// Key Provider Trait
// =============================================================================

/// Source of the cluster-wide shared secret.
pub trait KeyProvider: Send + Sync {
    /// Returns the shared secret bytes.
    fn shared_secret(&self) -> Result<[u8; AES256_KEY_SIZE]>;

    /// Derives the key for one message from the shared secret and its nonce.
    fn derive_message_key(
        &self,
        nonce: &[u8; AES_GCM_NONCE_SIZE],
    ) -> Result<[u8; AES256_KEY_SIZE]>;
}

// =============================================================================
// Environment Variable Key Provider
// =============================================================================

/// Key provider that reads the shared secret from `CLUSTERDB_SHARED_SECRET`.
///
/// A 64-character hex value is used as the key directly; any other value is
/// treated as a passphrase and hashed with SHA-256.
///
/// ```bash
/// export CLUSTERDB_SHARED_SECRET="0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
/// ```
pub struct EnvKeyProvider {
    secret: [u8; AES256_KEY_SIZE],
}

impl EnvKeyProvider {
    /// Reads the shared secret from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unset or empty.
    pub fn from_env() -> Result<Self> {
        let value = env::var(SHARED_SECRET_ENV_VAR).map_err(|_| {
            Error::KeyProvider(format!("{} environment variable not set", SHARED_SECRET_ENV_VAR))
        })?;
        Self::from_secret_str(&value)
    }

    /// Interprets a configured secret string (hex key or passphrase).
    pub fn from_secret_str(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(Error::KeyProvider(format!("{} is empty", SHARED_SECRET_ENV_VAR)));
        }
        if value.len() == AES256_KEY_SIZE * 2 {
            if let Ok(bytes) = hex_decode(value) {
                let mut secret = [0u8; AES256_KEY_SIZE];
                secret.copy_from_slice(&bytes);
                return Ok(Self { secret });
            }
        }
        Ok(Self::from_passphrase(value))
    }

    /// Creates a provider with a specific key (for testing).
    pub fn from_key(key: [u8; AES256_KEY_SIZE]) -> Self {
        Self { secret: key }
    }

    /// Creates a provider from a human-chosen passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut secret = [0u8; AES256_KEY_SIZE];
        secret.copy_from_slice(&digest);
        Self { secret }
    }
}

impl KeyProvider for EnvKeyProvider {
    fn shared_secret(&self) -> Result<[u8; AES256_KEY_SIZE]> {
        Ok(self.secret)
    }

    fn derive_message_key(
        &self,
        nonce: &[u8; AES_GCM_NONCE_SIZE],
    ) -> Result<[u8; AES256_KEY_SIZE]> {
        // salt: first half of the secret; info: context || nonce
        let salt = &self.secret[..16];

        let mut info = Vec::with_capacity(KEY_CONTEXT.len() + AES_GCM_NONCE_SIZE);
        info.extend_from_slice(KEY_CONTEXT);
        info.extend_from_slice(nonce);

        let hk = Hkdf::<Sha256>::new(Some(salt), &self.secret);
        let mut output = [0u8; AES256_KEY_SIZE];
        hk.expand(&info, &mut output)
            .map_err(|_| Error::KeyProvider("HKDF expand failed".into()))?;

        Ok(output)
    }
}

// =============================================================================
// Packet Cipher
// =============================================================================

/// Seals and opens packet payloads.
///
/// Always compresses and encrypts together. Cheap to clone; clones share the
/// key provider.
#[derive(Clone)]
pub struct PacketCipher {
    key_provider: Arc<dyn KeyProvider>,
}

impl PacketCipher {
    pub fn new(key_provider: impl KeyProvider + 'static) -> Self {
        Self {
            key_provider: Arc::new(key_provider),
        }
    }

    /// Creates a cipher from `CLUSTERDB_SHARED_SECRET`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(EnvKeyProvider::from_env()?))
    }

    /// Compresses and encrypts a payload, binding it to `envelope`.
    ///
    /// # Process
    ///
    /// 1. Compress plaintext with Zstd level 1
    /// 2. Generate random 12-byte nonce
    /// 3. Derive the message key via HKDF
    /// 4. Encrypt with AES-256-GCM, envelope bytes as associated data
    pub fn seal(&self, plaintext: &[u8], envelope: &MessageEnvelope) -> Result<Vec<u8>> {
        let compressed = zstd::encode_all(plaintext, ZSTD_COMPRESSION_LEVEL)
            .map_err(|e| Error::Compression(e.to_string()))?;

        let nonce = generate_nonce();
        let key = self.key_provider.derive_message_key(&nonce)?;
        let aad = envelope.encode()?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Encryption(format!("failed to create cipher: {}", e)))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &compressed,
                    aad: &aad,
                },
            )
            .map_err(|e| Error::Encryption(format!("encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(AES_GCM_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts and decompresses a payload sealed for `envelope`.
    ///
    /// # Errors
    ///
    /// Any failure (short input, wrong secret, tampering, envelope mismatch,
    /// corrupt compression) is reported as [`Error::MalformedPacket`].
    pub fn open(&self, sealed: &[u8], envelope: &MessageEnvelope) -> Result<Vec<u8>> {
        if sealed.len() < AES_GCM_NONCE_SIZE {
            return Err(Error::MalformedPacket(format!(
                "sealed payload too short ({} bytes)",
                sealed.len()
            )));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(AES_GCM_NONCE_SIZE);
        let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);

        let key = self.key_provider.derive_message_key(&nonce)?;
        let aad = envelope.encode()?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Encryption(format!("failed to create cipher: {}", e)))?;
        let compressed = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::MalformedPacket("payload failed authentication".into()))?;

        zstd::decode_all(compressed.as_slice())
            .map_err(|e| Error::MalformedPacket(format!("corrupt compressed payload: {}", e)))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn generate_nonce() -> [u8; AES_GCM_NONCE_SIZE] {
    let mut rng = StdRng::from_entropy();
    let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
    rng.fill_bytes(&mut nonce);
    nonce
}

fn hex_decode(hex: &str) -> std::result::Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("hex string must have even length".into());
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .ok_or_else(|| format!("non-ascii hex at position {}", i))
                .and_then(|pair| {
                    u8::from_str_radix(pair, 16)
                        .map_err(|e| format!("invalid hex at position {}: {}", i, e))
                })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OriginSeq, ReplicaId, SequencerSeq};

    fn test_key() -> [u8; 32] {
        [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
            0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
            0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17,
            0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
        ]
    }

    fn cipher() -> PacketCipher {
        PacketCipher::new(EnvKeyProvider::from_key(test_key()))
    }

    fn envelope(seq: u64) -> MessageEnvelope {
        MessageEnvelope::unresolved(ReplicaId::new("a"), OriginSeq::from_raw(seq))
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let plaintext = b"Hello, world! This is a transaction packet.";
        let sealed = cipher().seal(plaintext, &envelope(1)).unwrap();
        assert_eq!(cipher().open(&sealed, &envelope(1)).unwrap(), plaintext);
    }

    #[test]
    fn test_seal_open_empty_payload() {
        let sealed = cipher().seal(b"", &envelope(1)).unwrap();
        assert!(cipher().open(&sealed, &envelope(1)).unwrap().is_empty());
    }

    #[test]
    fn test_same_plaintext_different_envelopes_differ() {
        let a = cipher().seal(b"same data", &envelope(1)).unwrap();
        let b = cipher().seal(b"same data", &envelope(2)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_payload_bound_to_envelope() {
        let sealed = cipher().seal(b"secret", &envelope(1)).unwrap();
        let other = envelope(1).resolved_by(ReplicaId::new("s"), SequencerSeq::from_raw(1));
        assert!(matches!(
            cipher().open(&sealed, &other),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let sealed = cipher().seal(b"secret", &envelope(1)).unwrap();
        let stranger = PacketCipher::new(EnvKeyProvider::from_passphrase("other"));
        assert!(matches!(
            stranger.open(&sealed, &envelope(1)),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_tampered_or_short_payload_fails() {
        let mut sealed = cipher().seal(b"important", &envelope(1)).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(cipher().open(&sealed, &envelope(1)).is_err());
        assert!(cipher().open(&[1, 2, 3], &envelope(1)).is_err());
    }

    #[test]
    fn test_secret_string_parsing() {
        let hex: String = test_key().iter().map(|b| format!("{:02x}", b)).collect();
        let provider = EnvKeyProvider::from_secret_str(&hex).unwrap();
        assert_eq!(provider.shared_secret().unwrap(), test_key());

        let phrase = EnvKeyProvider::from_secret_str("correct horse").unwrap();
        assert_eq!(
            phrase.shared_secret().unwrap(),
            EnvKeyProvider::from_passphrase("correct horse").shared_secret().unwrap()
        );
        assert!(EnvKeyProvider::from_secret_str("").is_err());
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex_decode("deadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(hex_decode("0").is_err());
        assert!(hex_decode("gg").is_err());
    }

    #[test]
    fn test_message_key_derivation() {
        let provider = EnvKeyProvider::from_key(test_key());
        let k1 = provider.derive_message_key(&[0u8; 12]).unwrap();
        assert_eq!(k1, provider.derive_message_key(&[0u8; 12]).unwrap());
        assert_ne!(k1, provider.derive_message_key(&[1u8; 12]).unwrap());
    }
}
