//! Transport abstraction over the messaging network.
//!
//! A [`Transport`] is one live link: it is connected once, reports what
//! happens on the link through an event channel, and is destroyed when the
//! connection manager is done with it. A fresh instance is created through a
//! [`TransportFactory`] for every connection attempt.
//!
//! Two drivers ship with the crate: [`WebSocketTransport`] speaks the frame
//! protocol directly over a WebSocket, and [`BridgeTransport`] drives a
//! headless helper process over stdio.

pub mod bridge;
pub mod error;
pub mod frame;
pub mod link;
pub mod websocket;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::{ConnectorConfig, TransportKind};
use crate::store::{AuthState, Credentials};
use crate::types::{DisconnectReason, InboundMessage};

pub use bridge::BridgeTransport;
pub use error::TransportError;
pub use websocket::WebSocketTransport;

/// Capacity of the per-link event channel.
pub(crate) const EVENT_BUFFER: usize = 64;

/// Link lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionUpdate {
    /// Pairing accepted; the session is not usable yet.
    Authenticated,
    /// The session is fully usable. `me` is the account id when known.
    Open { me: Option<String> },
    Closed(DisconnectReason),
}

/// Everything a live link reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A pairing payload to show to a human.
    Qr(String),
    Connection(ConnectionUpdate),
    /// Credentials changed and must be persisted.
    CredentialsUpdate(Credentials),
    Message(InboundMessage),
}

/// Result of a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkHealth {
    Connected,
    /// The link answered but is not in a usable state.
    Degraded(String),
}

/// What a transport needs to come up.
#[derive(Clone)]
pub struct ConnectParams {
    pub session_name: String,
    pub credentials: Credentials,
    /// Answers the peer's key-material requests.
    pub auth: Arc<AuthState>,
}

/// One live link to the network.
pub trait Transport: Send + Sync {
    /// Bring the link up. Events arrive on the returned channel until the link
    /// closes; the channel ending means the link is gone.
    fn connect(
        &self,
        params: ConnectParams,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<TransportEvent>, TransportError>>;

    /// Send a text message to `recipient` (phone digits); returns the message id.
    fn send_message<'a>(
        &'a self,
        recipient: &'a str,
        body: &'a str,
    ) -> BoxFuture<'a, Result<String, TransportError>>;

    /// Registered id for `phone`, or `None` if the number is not on the network.
    fn lookup<'a>(&'a self, phone: &'a str) -> BoxFuture<'a, Result<Option<String>, TransportError>>;

    /// Re-establish the end-to-end session with `recipient`.
    fn repair_session<'a>(&'a self, recipient: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;

    fn probe(&self) -> BoxFuture<'_, Result<LinkHealth, TransportError>>;

    /// Tear the link down. Safe to call more than once.
    fn destroy(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn name(&self) -> &'static str;
}

/// Creates a fresh transport per connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Transport>;
}

/// Factory that picks the driver named in the configuration.
pub struct DriverFactory {
    config: ConnectorConfig,
}

impl DriverFactory {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for DriverFactory {
    fn create(&self) -> Arc<dyn Transport> {
        match self.config.transport {
            TransportKind::Native => Arc::new(WebSocketTransport::new(
                self.config.network_endpoint.clone(),
                self.config.send_timeout,
            )),
            TransportKind::Browser => Arc::new(BridgeTransport::new(
                self.config.bridge_command.clone(),
                self.config.bridge_args.clone(),
                self.config.send_timeout,
            )),
        }
    }
}
