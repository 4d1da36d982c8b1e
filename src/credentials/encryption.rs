//! AES-256-GCM envelope for the credential document.
//!
//! The whole serialized document is sealed with a fresh nonce on every write.
//! The master key is 32 bytes, base64-encoded, and comes from the environment.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Sealed form of the credential document as written to disk.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub version: u32,
    pub nonce: String,
    pub ciphertext: String,
}

impl Envelope {
    /// A document is sealed when it parses as an envelope.
    pub fn detect(raw: &str) -> Option<Self> {
        serde_json::from_str::<Envelope>(raw).ok()
    }
}

/// Seals and opens credential documents with a fixed master key.
#[derive(Clone)]
pub struct DocumentCipher {
    cipher: Aes256Gcm,
}

impl DocumentCipher {
    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .context("Failed to decode base64 encryption key")?;

        if key_bytes.len() != KEY_SIZE {
            return Err(anyhow!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key_bytes.len()
            ));
        }

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub(crate) fn seal(&self, version: u32, plaintext: &[u8]) -> Result<Envelope> {
        // Fresh nonce per write, never reused
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok(Envelope {
            version,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    pub(crate) fn open(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .context("Failed to decode nonce")?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .context("Failed to decode ciphertext")?;

        self.cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))
    }
}

/// Generates a random base64-encoded master key.
pub fn generate_key() -> String {
    BASE64.encode(Aes256Gcm::generate_key(&mut OsRng))
}
