use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    config::ConnectorConfig,
    connection::ConnectionManager,
    dispatch::{Delivered, DispatchError, MessageDispatcher},
    store::{FileStore, KeyValueStore, StoreError, StoreKeys},
    transport::{DriverFactory, TransportFactory},
    types::{ConnectionSession, ConnectionStatusReport, ConnectorEvent, EventBus, QrArtifact},
};

/// High-level facade over the connection lifecycle and message delivery.
///
/// One instance owns the session of the process. Call
/// [`initialize`](Self::initialize) once at startup and
/// [`teardown`](Self::teardown) on shutdown.
pub struct MessagingClient {
    connection: ConnectionManager,
    dispatcher: MessageDispatcher,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to decode stored {what}: {source}")]
    Decode {
        what: &'static str,
        source: serde_json::Error,
    },
}

impl MessagingClient {
    /// Client using the driver named in `config`, backed by `store`.
    pub fn new(config: ConnectorConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let factory = Arc::new(DriverFactory::new(config.clone()));
        Self::with_factory(config, factory, store)
    }

    pub fn with_factory(
        config: ConnectorConfig,
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let connection = ConnectionManager::new(config, factory, store, EventBus::default());
        let dispatcher = MessageDispatcher::new(connection.clone());
        Self {
            connection,
            dispatcher,
        }
    }

    /// Client backed by the durable file store at `config.store_path`.
    pub fn open(config: ConnectorConfig) -> Result<Self, ClientError> {
        let store = Arc::new(FileStore::open(&config.store_path)?);
        Ok(Self::new(config, store))
    }

    pub async fn initialize(&self) {
        self.connection.initialize().await
    }

    pub async fn teardown(&self) {
        self.connection.teardown().await
    }

    /// Deliver `body` to `phone`; fails fast with `NotReady` unless connected.
    pub async fn send_message(&self, phone: &str, body: &str) -> Result<Delivered, DispatchError> {
        self.dispatcher.send(phone, body).await
    }

    pub fn connection_status(&self) -> ConnectionStatusReport {
        self.connection.report()
    }

    pub fn qr_code(&self) -> Option<QrArtifact> {
        self.connection.qr_code()
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    /// Reconnect from scratch with the attempt counter reset.
    pub async fn reconnect(&self) {
        self.connection.reconnect().await
    }

    /// Discard the session credentials; the next connect starts QR pairing.
    pub async fn logout(&self) -> Result<(), ClientError> {
        Ok(self.connection.logout().await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.connection.events().subscribe()
    }

    /// Canonical form of a phone number under the configured plan.
    pub fn normalize(&self, raw: &str) -> String {
        self.dispatcher.resolver().normalize(raw)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

/// Status snapshot last persisted by a running connector.
pub fn stored_session(
    store: &dyn KeyValueStore,
    config: &ConnectorConfig,
) -> Result<Option<ConnectionSession>, ClientError> {
    let keys = StoreKeys::new(&config.key_prefix, &config.session_name);
    read_json(store, &keys.status(), "status snapshot")
}

/// QR artifact cached by a running connector, if still within its window.
pub fn stored_qr(
    store: &dyn KeyValueStore,
    config: &ConnectorConfig,
) -> Result<Option<QrArtifact>, ClientError> {
    let keys = StoreKeys::new(&config.key_prefix, &config.session_name);
    read_json(store, &keys.qr(), "QR code")
}

fn read_json<T: serde::de::DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
    what: &'static str,
) -> Result<Option<T>, ClientError> {
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| ClientError::Decode { what, source }),
        None => Ok(None),
    }
}
