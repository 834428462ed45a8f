//! Network addresses (JIDs) of chat participants.

use std::fmt;
use std::str::FromStr;

/// Known JID servers.
pub mod servers {
    /// Multi-device user server used by the native protocol.
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    /// User server used by the web client (browser bridge).
    pub const LEGACY_USER: &str = "c.us";
    pub const GROUP: &str = "g.us";
    pub const BROADCAST: &str = "broadcast";
}

/// `user[:device]@server`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Jid {
    pub user: String,
    pub device: u16,
    pub server: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// Address of a phone-number account on `server`.
    pub fn user(phone: impl Into<String>, server: &str) -> Self {
        Self::new(phone, server)
    }

    /// Same account without the device part.
    pub fn to_non_device(&self) -> Self {
        Self::new(self.user.clone(), self.server.clone())
    }

    pub fn is_user(&self) -> bool {
        self.server == servers::DEFAULT_USER || self.server == servers::LEGACY_USER
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to parse JID: {0}")]
pub struct ParseJidError(pub String);

impl FromStr for Jid {
    type Err = ParseJidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((user, server)) = s.split_once('@') else {
            return Ok(Jid::new("", s));
        };
        if server.contains('@') {
            return Err(ParseJidError("unexpected number of @ in JID".to_string()));
        }

        let (user, device) = match user.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse()
                    .map_err(|_| ParseJidError("failed to parse device from JID".to_string()))?;
                (user, device)
            }
            None => (user, 0),
        };
        // Agent suffix (`user.0:1`) is dropped, only the device matters here.
        let user = user.split_once('.').map_or(user, |(user, _)| user);

        Ok(Jid {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }
}
