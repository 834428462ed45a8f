//! Typed transport errors.
//!
//! Raw peer error codes and messages are mapped onto [`TransportError`] once,
//! in [`TransportError::classify`], as frames cross the adapter boundary.
//! Nothing above the drivers inspects error strings.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Transient network failure; retried by reconnection or the next candidate.
    #[error("network error: {0}")]
    Network(String),
    /// A bounded call did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The account was logged out; the session needs a new QR bootstrap.
    #[error("logged out: {0}")]
    LoggedOut(String),
    #[error("recipient is not registered: {0}")]
    UnregisteredRecipient(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    /// No end-to-end session key for the recipient; repairable once.
    #[error("missing session key: {0}")]
    SessionKeyMissing(String),
    /// Failure after the message left (read receipt, chat bookkeeping).
    #[error("post-send step failed: {0}")]
    PostSendAck(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Unknown(String),
}

impl TransportError {
    /// Map a peer error code and/or message onto the taxonomy.
    pub fn classify(code: Option<&str>, message: &str) -> Self {
        if let Some(err) = code.and_then(|code| Self::from_code(code, message)) {
            return err;
        }

        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["sendseen", "markedunread", "read receipt", "receipt ack"]) {
            TransportError::PostSendAck(message.to_string())
        } else if has(&["no session", "no sessions", "session record", "sessionerror"]) {
            TransportError::SessionKeyMissing(message.to_string())
        } else if has(&["rate-overlimit", "rate limit", "too many requests"]) {
            TransportError::RateLimited { retry_after: None }
        } else if has(&["not registered", "not on whatsapp", "not a whatsapp user", "no lid"]) {
            TransportError::UnregisteredRecipient(message.to_string())
        } else if has(&["logged out", "unpaired", "device removed"]) {
            TransportError::LoggedOut(message.to_string())
        } else if has(&[
            "econnreset",
            "socket hang up",
            "connection closed",
            "connection reset",
            "network",
            "stream errored",
        ]) {
            TransportError::Network(message.to_string())
        } else {
            TransportError::Unknown(message.to_string())
        }
    }

    fn from_code(code: &str, message: &str) -> Option<Self> {
        let message = message.to_string();
        Some(match code {
            "ack-failed" | "receipt-failed" => TransportError::PostSendAck(message),
            "no-session" | "session-missing" => TransportError::SessionKeyMissing(message),
            "rate-overlimit" | "429" => TransportError::RateLimited { retry_after: None },
            "not-registered" | "not-on-network" | "404" => {
                TransportError::UnregisteredRecipient(message)
            }
            "logged-out" | "401" => TransportError::LoggedOut(message),
            "network" | "connection-closed" | "503" => TransportError::Network(message),
            "not-connected" => TransportError::NotConnected,
            _ => return None,
        })
    }

    /// Attach a server supplied retry hint to a rate limit error.
    pub fn with_retry_after(self, retry_after: Option<Duration>) -> Self {
        match self {
            TransportError::RateLimited { .. } => TransportError::RateLimited { retry_after },
            other => other,
        }
    }
}
