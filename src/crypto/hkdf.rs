//! HKDF-SHA256 (RFC 5869).
//!
//! Derives the at-rest sealing key from the configured store secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256 key derivation.
pub struct Hkdf {
    prk: [u8; 32],
}

impl Hkdf {
    /// Extract a pseudorandom key from `ikm` with an optional salt.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = salt.unwrap_or(&[0u8; 32]);
        let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC can take key of any size");
        mac.update(ikm);
        let prk: [u8; 32] = mac.finalize().into_bytes().into();

        Self { prk }
    }

    /// Expand the key to the desired length with optional info.
    pub fn expand(&self, info: &[u8], length: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(length);
        let mut t = Vec::new();
        let mut counter = 1u8;

        while output.len() < length {
            let mut mac =
                HmacSha256::new_from_slice(&self.prk).expect("HMAC can take key of any size");
            mac.update(&t);
            mac.update(info);
            mac.update(&[counter]);
            t = mac.finalize().into_bytes().to_vec();

            let remaining = length - output.len();
            output.extend_from_slice(&t[..remaining.min(t.len())]);

            counter += 1;
        }

        output
    }

    /// Extract and expand into a single 32-byte key.
    pub fn derive_key(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Self::new(salt, ikm).expand(info, 32));
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_rfc5869_case_1() {
        let ikm = [0x0b; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();

        let okm = Hkdf::new(Some(&salt), &ikm).expand(&info, 42);
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_derive_key_depends_on_info() {
        let a = Hkdf::derive_key(None, b"secret", b"credentials");
        let b = Hkdf::derive_key(None, b"secret", b"keys");
        assert_ne!(a, b);
    }
}
