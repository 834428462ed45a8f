//! Curve25519 key pairs used in stored credential sets.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey, StaticSecret};

/// A Curve25519 key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Public key (32 bytes)
    #[serde(with = "hex32")]
    pub public: [u8; 32],
    /// Private key (32 bytes)
    #[serde(with = "hex32")]
    pub private: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);

        // Curve25519 clamping
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;

        Self::from_private_key(private)
    }

    /// Create a key pair from an existing private key.
    pub fn from_private_key(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);

        Self {
            public: *public.as_bytes(),
            private,
        }
    }

    /// Short hex fingerprint of the public key, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public[..8])
    }

    /// Sign another key pair's public key (`0x05 || public`).
    pub fn sign(&self, key_to_sign: &KeyPair) -> [u8; 64] {
        use ed25519_dalek::{Signer, SigningKey};

        let mut message = [0u8; 33];
        message[0] = 0x05;
        message[1..].copy_from_slice(&key_to_sign.public);

        let signing_key = SigningKey::from_bytes(&self.private);
        signing_key.sign(&message).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// A signed pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey {
    pub key_pair: KeyPair,
    pub key_id: u32,
    /// Ed25519 signature by the identity key, hex encoded when stored.
    #[serde(with = "hex_opt")]
    pub signature: Option<Vec<u8>>,
}

impl PreKey {
    /// Generate an unsigned pre-key with the given ID.
    pub fn new(key_id: u32) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            key_id,
            signature: None,
        }
    }

    /// Generate a pre-key signed by `identity_key`.
    pub fn new_signed(key_id: u32, identity_key: &KeyPair) -> Self {
        let mut pre_key = Self::new(key_id);
        pre_key.signature = Some(identity_key.sign(&pre_key.key_pair).to_vec());
        pre_key
    }
}

mod hex32 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod hex_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| hex::decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
