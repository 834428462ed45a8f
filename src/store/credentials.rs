//! Identity credentials of a linked device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{KeyPair, PreKey};

/// Primary credential set. Per-conversation key material is stored apart,
/// see [`AuthState::get_keys`](crate::store::AuthState::get_keys).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Noise static key pair
    pub noise_key: KeyPair,
    /// Signal identity key pair
    pub identity_key: KeyPair,
    pub signed_pre_key: PreKey,
    /// 14-bit registration ID
    pub registration_id: u32,
    /// Advertisement secret, hex
    pub adv_secret_key: String,
    /// Account id once pairing succeeded
    #[serde(default)]
    pub me: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub registered: bool,
    pub created_at: DateTime<Utc>,
}

impl Credentials {
    /// Fresh, unregistered credential set.
    pub fn generate() -> Self {
        let identity_key = KeyPair::generate();
        let signed_pre_key = PreKey::new_signed(1, &identity_key);
        let adv_secret: [u8; 32] = rand::random();

        Self {
            noise_key: KeyPair::generate(),
            identity_key,
            signed_pre_key,
            registration_id: (rand::random::<u32>() & 0x3FFF).max(1),
            adv_secret_key: hex::encode(adv_secret),
            me: None,
            platform: None,
            registered: false,
            created_at: Utc::now(),
        }
    }

    /// Whether the credentials belong to a paired account.
    pub fn is_registered(&self) -> bool {
        self.registered && self.me.is_some()
    }
}
