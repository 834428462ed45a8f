//! Cryptographic primitives backing stored session credentials.
//!
//! - Curve25519 key pairs and signed pre-keys for fresh credential sets
//! - HKDF-SHA256 for deriving the at-rest sealing key
//! - AES-256-GCM sealing of values written to the key/value store

mod keypair;
mod hkdf;
mod cipher;

pub use keypair::{KeyPair, PreKey};
pub use hkdf::Hkdf;
pub use cipher::{CipherError, Sealer};
