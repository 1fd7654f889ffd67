//! Token encryption using AES-256-GCM.
//!
//! Authenticated encryption for OAuth tokens at rest. The engine treats
//! tokens as opaque strings (spec §1); this module is the only place that
//! knows the encoding. Ciphertext is bound to the owning connection id as
//! additional authenticated data so a ciphertext copied onto a different
//! connection's row fails to decrypt rather than silently decrypting to
//! the wrong plaintext.

use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Error, Result};

const NONCE_LENGTH: usize = 12;

/// Token encryptor/decryptor, keyed once at process start.
pub struct TokenEncryptor {
    key: Option<LessSafeKey>,
    rng: SystemRandom,
}

impl TokenEncryptor {
    /// Build from a base64-encoded 32-byte key, e.g. from `Config::encryption_key_b64`.
    pub fn from_base64_key(key_b64: &str) -> Result<Self> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64)
            .map_err(|e| Error::Credential(format!("invalid base64 key: {e}")))?;

        if key_bytes.len() != 32 {
            return Err(Error::Credential(format!(
                "invalid key length: expected 32 bytes, got {}",
                key_bytes.len()
            )));
        }

        let unbound_key = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| Error::Credential("failed to create encryption key".to_string()))?;

        Ok(Self {
            key: Some(LessSafeKey::new(unbound_key)),
            rng: SystemRandom::new(),
        })
    }

    /// Insecure encryptor for tests: stores plaintext base64-encoded, no AAD check.
    #[cfg(test)]
    pub fn new_insecure() -> Self {
        Self {
            key: None,
            rng: SystemRandom::new(),
        }
    }

    /// Encrypt a plaintext token, binding it to `connection_id` as AAD.
    ///
    /// Returns base64-encoded `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &str, connection_id: &uuid::Uuid) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let Some(ref key) = self.key else {
            return Ok(base64::engine::general_purpose::STANDARD.encode(plaintext));
        };

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Credential("failed to generate nonce".to_string()))?;

        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let aad = Aad::from(connection_id.as_bytes());

        let mut in_out = plaintext.as_bytes().to_vec();
        in_out.reserve(AES_256_GCM.tag_len());

        key.seal_in_place_append_tag(nonce, aad, &mut in_out)
            .map_err(|_| Error::Credential("encryption failed".to_string()))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&in_out);

        Ok(base64::engine::general_purpose::STANDARD.encode(&result))
    }

    /// Decrypt a base64-encoded ciphertext produced by [`Self::encrypt`] for
    /// the same `connection_id`.
    pub fn decrypt(&self, ciphertext_b64: &str, connection_id: &uuid::Uuid) -> Result<String> {
        if ciphertext_b64.is_empty() {
            return Ok(String::new());
        }

        let Some(ref key) = self.key else {
            let plaintext_bytes = base64::engine::general_purpose::STANDARD
                .decode(ciphertext_b64)
                .map_err(|e| Error::Credential(format!("invalid base64 plaintext: {e}")))?;
            return String::from_utf8(plaintext_bytes)
                .map_err(|e| Error::Credential(format!("invalid utf-8: {e}")));
        };

        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| Error::Credential(format!("invalid base64 ciphertext: {e}")))?;

        if ciphertext.len() < NONCE_LENGTH {
            return Err(Error::Credential("ciphertext too short".to_string()));
        }

        let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_LENGTH);
        let mut nonce_array = [0u8; NONCE_LENGTH];
        nonce_array.copy_from_slice(nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_array);
        let aad = Aad::from(connection_id.as_bytes());

        let mut in_out = encrypted.to_vec();
        let plaintext = key
            .open_in_place(nonce, aad, &mut in_out)
            .map_err(|_| Error::Credential("decryption failed or data tampered".to_string()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|e| Error::Credential(format!("invalid utf-8 after decryption: {e}")))
    }
}

/// Mask a token-derived value for safe logging, e.g. `"ya29...xyz"` -> `"ya29***xyz"`.
pub fn mask_for_logging(value: &str) -> String {
    if value.len() <= 8 {
        return "***".to_string();
    }
    format!("{}***{}", &value[..4], &value[value.len() - 4..])
}
