//! AES-256-GCM sealing for values kept in the key/value store.
//!
//! Sealed values are `base64(nonce || ciphertext)`. The storage key is bound
//! as associated data, so a value copied under another key fails to open.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use thiserror::Error;

use crate::crypto::Hkdf;

const NONCE_LEN: usize = 12;
const SEAL_INFO: &[u8] = b"wa-connector auth state v1";

/// Cipher errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("invalid key")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("sealed value is not valid base64")]
    Encoding,
}

/// Seals and opens store values with a key derived from a shared secret.
#[derive(Clone)]
pub struct Sealer {
    key: [u8; 32],
}

impl Sealer {
    /// Derive the sealing key from a configured secret.
    pub fn from_secret(secret: &str) -> Self {
        Self {
            key: Hkdf::derive_key(None, secret.as_bytes(), SEAL_INFO),
        }
    }

    pub fn seal(&self, storage_key: &str, plaintext: &[u8]) -> Result<String, CipherError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: storage_key.as_bytes(),
                },
            )
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, storage_key: &str, sealed: &str) -> Result<Vec<u8>, CipherError> {
        let raw = STANDARD.decode(sealed).map_err(|_| CipherError::Encoding)?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError::DecryptionFailed);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: storage_key.as_bytes(),
                },
            )
            .map_err(|_| CipherError::DecryptionFailed)
    }
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer").field("key", &"[REDACTED]").finish()
    }
}
