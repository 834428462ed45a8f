//! Events published by the connector.
//!
//! Observers (delivery bookkeeping, operator dashboards) subscribe through an
//! [`EventBus`]. Publishing is fire-and-forget: the core never waits on, or
//! fails because of, a subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::ConnectionStatus;

/// Reason the link to the network went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The account was logged out (device unlinked); credentials are void.
    LoggedOut,
    /// Another client took over the session.
    Replaced,
    /// The server closed the connection.
    ServerRequested,
    /// Network level failure.
    NetworkError(String),
    /// The periodic liveness probe failed or timed out.
    HealthCheckFailed(String),
    /// `initialize` could not bring the transport up.
    ConnectFailed(String),
    /// Operator requested disconnect.
    Manual,
    Unknown,
}

impl DisconnectReason {
    /// Whether the state machine should try to reconnect on its own.
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, DisconnectReason::LoggedOut | DisconnectReason::Manual)
    }
}

/// Short-lived pairing payload shown to a human for scanning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrArtifact {
    /// Raw payload produced by the transport.
    pub value: String,
    /// `data:image/svg+xml;base64,...` rendering of the payload.
    pub image: String,
    /// Unicode half-block rendering for terminals.
    pub terminal: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl QrArtifact {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Delivery state of an outbound message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

/// Bookkeeping record of one `send` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: String,
    /// Candidate currently (or finally) addressed.
    pub recipient_candidate: String,
    pub body: String,
    /// Number of transport send calls issued so far.
    pub attempt_index: u32,
    pub status: MessageStatus,
    pub last_error: Option<String>,
}

/// Message received from the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// All events published by the connector.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    StatusChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
        reconnect_attempts: u32,
        reason: Option<DisconnectReason>,
    },
    QrCode(QrArtifact),
    ReconnectScheduled {
        attempt: u32,
        delay: std::time::Duration,
        cooldown: bool,
    },
    MessageSent(OutboundMessage),
    MessageFailed(OutboundMessage),
    MessageReceived(InboundMessage),
}

/// Fire-and-forget broadcast of [`ConnectorEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; having none is fine.
    pub fn publish(&self, event: ConnectorEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
