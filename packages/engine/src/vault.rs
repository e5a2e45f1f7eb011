//! AEAD encryption-at-rest for secrets the store would otherwise persist in
//! plaintext: webhook shared secrets, OAuth tokens for inbound adapters
//! (C12). A thin wrapper over `aes-gcm`, following the teacher's pattern of
//! a single `Vault`-style helper type rather than scattering cipher calls
//! across call sites.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("CREDENTIALS_ENCRYPTION_KEY must decode to exactly 32 bytes")]
    BadKeyLength,
    #[error("CREDENTIALS_ENCRYPTION_KEY is not valid base64")]
    BadKeyEncoding,
    #[error("ciphertext is not valid base64")]
    BadCiphertextEncoding,
    #[error("ciphertext is too short to contain a nonce")]
    Truncated,
    #[error("decryption failed: ciphertext was tampered with or the key is wrong")]
    DecryptionFailed,
}

/// Encrypts and decrypts short strings with AES-256-GCM, framing each
/// ciphertext as `base64(nonce || ciphertext)` so a single column can hold
/// both the nonce and payload.
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// `key_b64` must decode to exactly 32 bytes (AES-256 key size).
    pub fn new(key_b64: &str) -> Result<Self, VaultError> {
        let raw = BASE64
            .decode(key_b64)
            .map_err(|_| VaultError::BadKeyEncoding)?;
        if raw.len() != 32 {
            return Err(VaultError::BadKeyLength);
        }
        let key = Key::<Aes256Gcm>::from_slice(&raw);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::DecryptionFailed)?;
        let mut framed = nonce.to_vec();
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    pub fn decrypt(&self, framed_b64: &str) -> Result<String, VaultError> {
        let framed = BASE64
            .decode(framed_b64)
            .map_err(|_| VaultError::BadCiphertextEncoding)?;
        if framed.len() < 12 {
            return Err(VaultError::Truncated);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(12);
        let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        BASE64.encode([7u8; 32])
    }

    #[test]
    fn round_trips() {
        let vault = Vault::new(&test_key()).unwrap();
        let encrypted = vault.encrypt("super-secret-token").unwrap();
        assert_ne!(encrypted, "super-secret-token");
        assert_eq!(vault.decrypt(&encrypted).unwrap(), "super-secret-token");
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let vault = Vault::new(&test_key()).unwrap();
        let mut encrypted = vault.encrypt("super-secret-token").unwrap();
        encrypted.push('A');
        assert!(vault.decrypt(&encrypted).is_err());
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(Vault::new(&BASE64.encode([1u8; 16])).is_err());
    }
}
