//! At-rest encryption for the sensitive `llm_requests` columns.
//!
//! `prompt`, `response` and `headers` are sealed with AES-256-GCM under a
//! 32-byte key from `storage.encryption_key` (base64). Each value gets a
//! fresh random 96-bit nonce. The stored text is
//!
//! ```text
//! enc:v1:<base64(nonce || ciphertext || tag)>
//! ```
//!
//! so rows written before a key was configured stay distinguishable from
//! sealed ones. Scoring always runs on plaintext; only the write path seals.

use std::fmt;

use base64::{Engine as _, engine::general_purpose};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};

use promptwatch_core::types::TrafficRecord;

use crate::error::TrafficError;

/// Marks a sealed column value.
pub const SEALED_PREFIX: &str = "enc:v1:";

/// Key length for AES-256.
pub const KEY_LEN: usize = 32;

/// Seals and opens column values.
pub struct FieldCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl FieldCipher {
    /// Builds a cipher from raw key bytes; the key must be exactly 32 bytes.
    pub fn new(key_bytes: &[u8]) -> Result<Self, TrafficError> {
        if key_bytes.len() != KEY_LEN {
            return Err(TrafficError::Encryption(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                key_bytes.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| TrafficError::Encryption("invalid encryption key".to_owned()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Builds a cipher from a base64 key, e.g. the output of
    /// `openssl rand -base64 32`.
    pub fn from_base64(encoded: &str) -> Result<Self, TrafficError> {
        let key_bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| TrafficError::Encryption(format!("encryption key is not base64: {e}")))?;
        Self::new(&key_bytes)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, TrafficError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| TrafficError::Encryption("failed to generate nonce".to_owned()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| TrafficError::Encryption("seal failed".to_owned()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(format!(
            "{SEALED_PREFIX}{}",
            general_purpose::STANDARD.encode(sealed)
        ))
    }

    /// Reverses [`seal`](Self::seal). Fails on values without the
    /// [`SEALED_PREFIX`], on a wrong key and on tampered ciphertext.
    pub fn open(&self, sealed: &str) -> Result<String, TrafficError> {
        let encoded = sealed
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| TrafficError::Encryption("value is not sealed".to_owned()))?;
        let mut data = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| TrafficError::Encryption(format!("sealed value is not base64: {e}")))?;
        if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(TrafficError::Encryption("sealed value too short".to_owned()));
        }

        let mut ciphertext = data.split_off(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(&data)
            .map_err(|_| TrafficError::Encryption("bad nonce".to_owned()))?;
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut ciphertext)
            .map_err(|_| TrafficError::Encryption("open failed (wrong key or tampered)".to_owned()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|e| TrafficError::Encryption(format!("sealed value is not UTF-8: {e}")))
    }
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldCipher")
            .field("algorithm", &"AES-256-GCM")
            .finish_non_exhaustive()
    }
}

pub fn is_sealed(value: &str) -> bool {
    value.starts_with(SEALED_PREFIX)
}

/// The sensitive columns of one `llm_requests` row, as written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFields {
    pub prompt: String,
    pub response: Option<String>,
    /// Headers as a JSON object; `None` when the record carried none.
    pub headers: Option<String>,
}

impl StoredFields {
    /// Column values for `record`, sealed when `cipher` is set and plaintext
    /// otherwise.
    pub fn from_record(
        record: &TrafficRecord,
        cipher: Option<&FieldCipher>,
    ) -> Result<Self, TrafficError> {
        let headers = if record.headers.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&record.headers)
                    .map_err(|e| TrafficError::Storage(format!("headers not serializable: {e}")))?,
            )
        };

        let Some(cipher) = cipher else {
            return Ok(Self {
                prompt: record.prompt.clone(),
                response: record.response.clone(),
                headers,
            });
        };

        Ok(Self {
            prompt: cipher.seal(&record.prompt)?,
            response: record.response.as_deref().map(|r| cipher.seal(r)).transpose()?,
            headers: headers.as_deref().map(|h| cipher.seal(h)).transpose()?,
        })
    }
}
