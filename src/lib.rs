//! wa-connector: a persistent, self-healing WhatsApp connection for
//! notification backends.
//!
//! Keeps one authenticated session alive across restarts and delivers
//! outbound text messages despite phone-number format ambiguity and transient
//! network failures.
//!
//! ## Modules
//!
//! - `config` - Connector configuration
//! - `types` - Connection status, events and JIDs
//! - `crypto` - Key pairs, HKDF and at-rest sealing of credentials
//! - `store` - Key/value stores and the auth-state persistence on top of them
//! - `phone` - Phone number canonicalization and send candidates
//! - `transport` - The transport trait, its two drivers and error taxonomy
//! - `connection` - Connection state machine, reconnection, health checks
//! - `expiring` - TTL map backing per-recipient cooldowns
//! - `dispatch` - Message delivery with per-error-class retry rules
//! - `client` - High-level facade

pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod dispatch;
pub mod expiring;
pub mod phone;
pub mod store;
pub mod transport;
pub mod types;

pub use client::{ClientError, MessagingClient};
pub use config::{BackoffConfig, ConfigError, ConnectorConfig, TransportKind};
pub use connection::{ConnectionError, ConnectionManager};
pub use dispatch::{Delivered, DispatchError, MessageDispatcher};
pub use phone::{NumberingPlan, PhoneCandidate, PhoneNumberResolver, Reconciliation};
pub use store::{AuthState, Credentials, FileStore, KeyValueStore, MemoryStore, StoreError};
pub use transport::{Transport, TransportError, TransportEvent, TransportFactory};
pub use types::{
    ConnectionStatus, ConnectionStatusReport, ConnectorEvent, DisconnectReason, EventBus, Jid,
    QrArtifact,
};
