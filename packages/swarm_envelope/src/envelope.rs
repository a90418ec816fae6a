//! The `{encrypted, data}` envelope and the sealer that produces it.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng, rand_core::RngCore};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::encoding::{base64_decode, base64_encode};
use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Pre-shared key used when no key is configured.
pub const DEFAULT_KEY: [u8; KEY_LEN] = [
    0x73, 0x77, 0x61, 0x72, 0x6d, 0x2d, 0x65, 0x6e, 0x76, 0x65, 0x6c, 0x6f, 0x70, 0x65, 0x2d, 0x6b,
    0x65, 0x79, 0x2d, 0x32, 0x30, 0x32, 0x36, 0x2d, 0x70, 0x72, 0x65, 0x2d, 0x73, 0x68, 0x61, 0x72,
];

/// Wire wrapper around a sealed (or plaintext) payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub encrypted: bool,
    pub data: String,
}

impl Envelope {
    /// Interpret an already-parsed JSON value as a sealed envelope.
    ///
    /// Only `encrypted: true` with a non-empty string `data` counts; anything
    /// else is a plain response and must be passed through untouched.
    pub fn recognize(value: &serde_json::Value) -> Option<Self> {
        let encrypted = value.get("encrypted")?.as_bool()?;
        let data = value.get("data")?.as_str()?;
        if !encrypted || data.is_empty() {
            return None;
        }
        Some(Self {
            encrypted,
            data: data.to_string(),
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "encrypted": self.encrypted, "data": self.data })
    }
}

/// Seals and opens envelopes under one process-wide key.
///
/// Every `seal` draws a fresh random nonce, so sealing the same plaintext
/// twice never yields the same `data`.
#[derive(Clone)]
pub struct Sealer {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer").finish_non_exhaustive()
    }
}

impl Default for Sealer {
    fn default() -> Self {
        Self::new(&DEFAULT_KEY)
    }
}

impl Sealer {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Build a sealer from a base64-encoded 32-byte key.
    pub fn from_base64(key: &str) -> Result<Self, CryptoError> {
        let bytes = base64_decode(key).map_err(|_| CryptoError::Encoding)?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(Self::new(&key))
    }

    /// Encrypt `plaintext` into an `{encrypted: true, data}` envelope.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(Envelope {
            encrypted: true,
            data: base64_encode(&combined),
        })
    }

    /// Recover the plaintext of an envelope.
    ///
    /// A plaintext envelope (`encrypted: false`) yields its `data` bytes as-is.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        if !envelope.encrypted {
            return Ok(envelope.data.as_bytes().to_vec());
        }
        self.open_data(&envelope.data)
    }

    /// Open a bare `data` string (nonce || ciphertext, base64).
    pub fn open_data(&self, data: &str) -> Result<Vec<u8>, CryptoError> {
        let combined = base64_decode(data).map_err(|_| CryptoError::Encoding)?;
        if combined.len() < NONCE_LEN {
            return Err(CryptoError::Malformed(format!(
                "payload of {} bytes is shorter than the nonce",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }

    /// Seal the JSON serialization of `value`.
    pub fn seal_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<Envelope, CryptoError> {
        let json = serde_json::to_vec(value).map_err(|e| CryptoError::Malformed(e.to_string()))?;
        self.seal(&json)
    }

    /// Open an envelope and parse its plaintext as JSON.
    pub fn open_json<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T, CryptoError> {
        let plaintext = self.open(envelope)?;
        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Malformed(e.to_string()))
    }

    /// Seal a UTF-8 string and return only the `data` part.
    pub fn seal_text(&self, text: &str) -> Result<String, CryptoError> {
        Ok(self.seal(text.as_bytes())?.data)
    }

    /// Open a `data` string produced by [`Sealer::seal_text`].
    pub fn open_text(&self, data: &str) -> Result<String, CryptoError> {
        let plaintext = self.open_data(data)?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Malformed("plaintext is not UTF-8".into()))
    }
}
