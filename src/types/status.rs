//! Connection status and the session record owned by the state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the connection to the messaging network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    QrReady,
    Authenticated,
    Ready,
    /// Logged out by the network; needs a new QR scan.
    AuthFailure,
}

impl ConnectionStatus {
    /// Whether the state machine may move from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        match (self, next) {
            (_, Disconnected) | (_, AuthFailure) => true,
            (Disconnected | AuthFailure, Connecting) => true,
            (Connecting, QrReady | Authenticated | Ready) => true,
            (QrReady, QrReady | Authenticated | Ready) => true,
            (Authenticated, Ready) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::QrReady => "QR_READY",
            ConnectionStatus::Authenticated => "AUTHENTICATED",
            ConnectionStatus::Ready => "READY",
            ConnectionStatus::AuthFailure => "AUTH_FAILURE",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single active session of the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionSession {
    pub session_name: String,
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_updated_at: DateTime<Utc>,
}

impl ConnectionSession {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_updated_at: Utc::now(),
        }
    }

    /// Reset to the initial state, keeping the name.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.session_name));
    }
}

/// Public view returned by `connection_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatusReport {
    pub status: ConnectionStatus,
    pub has_qr_code: bool,
    pub qr_expiry: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub last_updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(QrReady));
        assert!(QrReady.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Ready));
        assert!(Connecting.can_transition_to(Ready));
    }

    #[test]
    fn test_every_state_can_drop_to_disconnected() {
        for status in [Disconnected, Connecting, QrReady, Authenticated, Ready, AuthFailure] {
            assert!(status.can_transition_to(Disconnected));
            assert!(status.can_transition_to(AuthFailure));
        }
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(QrReady));
        assert!(!Ready.can_transition_to(Connecting));
        assert!(!AuthFailure.can_transition_to(Ready));
    }

    #[test]
    fn test_status_serializes_screaming() {
        assert_eq!(serde_json::to_string(&QrReady).unwrap(), "\"QR_READY\"");
        assert_eq!(QrReady.to_string(), "QR_READY");
    }

    #[test]
    fn test_session_reset() {
        let mut session = ConnectionSession::new("erp");
        session.status = Ready;
        session.reconnect_attempts = 3;
        session.reset();
        assert_eq!(session.session_name, "erp");
        assert_eq!(session.status, Disconnected);
        assert_eq!(session.reconnect_attempts, 0);
    }
}
