//! Connection state machine.
//!
//! `ConnectionManager` is the single owner of the live transport. Every
//! status change goes through [`Inner::transition`], which applies the side
//! effects: status snapshot, status event, QR discard, reconnection.
//!
//! Each connection attempt gets a generation number. Events and failures from
//! an older generation are ignored, so a replaced transport can never tear
//! down its successor.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::config::ConnectorConfig;
use crate::connection::{
    backup, health, Backoff, BackoffPolicy, ConnectionError, QrLifecycle, ReconnectScheduler,
    TaskSlot,
};
use crate::crypto::Sealer;
use crate::store::{AuthState, Credentials, KeyValueStore, StoreKeys, StoreResult};
use crate::transport::{
    ConnectParams, ConnectionUpdate, Transport, TransportError, TransportEvent, TransportFactory,
};
use crate::types::{
    ConnectionSession, ConnectionStatus, ConnectionStatusReport, ConnectorEvent,
    DisconnectReason, EventBus, QrArtifact,
};

/// Upper bound for releasing a transport.
const DESTROY_TIMEOUT: Duration = Duration::from_secs(10);

/// Owner of the connection lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) config: ConnectorConfig,
    factory: Arc<dyn TransportFactory>,
    pub(super) auth: Arc<AuthState>,
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
    events: EventBus,
    session: Mutex<ConnectionSession>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    generation: AtomicU64,
    pub(super) connecting: AtomicBool,
    manual: AtomicBool,
    qr: QrLifecycle,
    scheduler: ReconnectScheduler,
    backoff: BackoffPolicy,
    health: TaskSlot,
    backup: TaskSlot,
    pump: TaskSlot,
    pub(super) latest_credentials: Mutex<Option<Credentials>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectorConfig,
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn KeyValueStore>,
        events: EventBus,
    ) -> Self {
        let keys = StoreKeys::new(&config.key_prefix, &config.session_name);
        let sealer = config.encryption_secret.as_deref().map(Sealer::from_secret);
        let auth = Arc::new(AuthState::new(
            store.clone(),
            keys.clone(),
            config.credential_ttl,
            sealer,
        ));

        let inner = Inner {
            session: Mutex::new(ConnectionSession::new(config.session_name.clone())),
            qr: QrLifecycle::new(config.qr_window),
            backoff: BackoffPolicy::new(config.backoff.clone()),
            config,
            factory,
            auth,
            store,
            keys,
            events,
            transport: Mutex::new(None),
            generation: AtomicU64::new(0),
            connecting: AtomicBool::new(false),
            manual: AtomicBool::new(false),
            scheduler: ReconnectScheduler::new(),
            health: TaskSlot::default(),
            backup: TaskSlot::default(),
            pump: TaskSlot::default(),
            latest_credentials: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start a connection attempt. A call while another attempt is in its
    /// critical section, or while a transport is live, does nothing.
    /// Failures leave the session `DISCONNECTED` with a reconnection scheduled.
    pub async fn initialize(&self) {
        self.inner.clone().initialize().await
    }

    /// Cancel all timers, snapshot the status and release the transport.
    pub async fn teardown(&self) {
        self.inner.teardown().await
    }

    /// Operator disconnect; no reconnection is scheduled.
    pub async fn disconnect(&self) {
        info!("[{}] disconnect requested", self.inner.config.session_name);
        self.inner.stop_manually().await;
    }

    /// Tear down, reset the attempt counter and connect again.
    pub async fn reconnect(&self) {
        info!("[{}] reconnect requested", self.inner.config.session_name);
        self.inner.stop_manually().await;
        self.inner.session().reconnect_attempts = 0;
        self.inner.persist_snapshot();
        self.inner.clone().initialize().await;
    }

    /// Disconnect and discard credentials; the next connect needs a QR scan.
    pub async fn logout(&self) -> StoreResult<()> {
        info!("[{}] logout requested", self.inner.config.session_name);
        self.inner.stop_manually().await;
        self.inner.auth.clear()?;
        *lock(&self.inner.latest_credentials) = None;
        self.inner.session().reset();
        self.inner.persist_snapshot();
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    pub fn session(&self) -> ConnectionSession {
        self.inner.session().clone()
    }

    pub fn report(&self) -> ConnectionStatusReport {
        let session = self.session();
        let qr = self.qr_code();
        ConnectionStatusReport {
            status: session.status,
            has_qr_code: qr.is_some(),
            qr_expiry: qr.map(|qr| qr.expires_at),
            reconnect_attempts: session.reconnect_attempts,
            last_updated_at: session.last_updated_at,
        }
    }

    /// Current pairing artifact, absent once expired or authenticated.
    pub fn qr_code(&self) -> Option<QrArtifact> {
        self.inner.qr.current()
    }

    /// The live transport, only while `READY`. Otherwise the current status.
    pub fn ready_transport(&self) -> Result<Arc<dyn Transport>, ConnectionStatus> {
        let status = self.status();
        if status != ConnectionStatus::Ready {
            return Err(status);
        }
        self.inner
            .current_transport()
            .ok_or(ConnectionStatus::Disconnected)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn auth(&self) -> &Arc<AuthState> {
        &self.inner.auth
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.scheduler.is_pending()
    }
}

impl Inner {
    fn initialize(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let name = self.config.session_name.clone();
            let Some(guard) = ConnectingGuard::acquire(&self.connecting) else {
                info!("[{name}] initialize already in progress, ignoring");
                return;
            };
            if self.current_transport().is_some() {
                debug!("[{name}] transport already live, ignoring initialize");
                return;
            }

            self.manual.store(false, Ordering::SeqCst);
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let result = self.connect_once(generation).await;
            drop(guard);

            match result {
                Ok(()) => {}
                Err(ConnectionError::Transport(TransportError::LoggedOut(detail))) => {
                    warn!("[{name}] credentials rejected: {detail}");
                    self.logged_out(generation).await;
                }
                Err(ConnectionError::Superseded) => {
                    debug!("[{name}] connection attempt superseded");
                }
                Err(err) => {
                    warn!("[{name}] connect failed: {err}");
                    self.link_lost(generation, DisconnectReason::ConnectFailed(err.to_string()))
                        .await;
                }
            }
        })
    }

    async fn connect_once(self: &Arc<Self>, generation: u64) -> Result<(), ConnectionError> {
        self.transition(ConnectionStatus::Connecting, None);

        let credentials = self.auth.load();
        *lock(&self.latest_credentials) = Some(credentials.clone());

        let transport = self.factory.create();
        info!(
            "[{}] connecting through the {} transport",
            self.config.session_name,
            transport.name()
        );
        let params = ConnectParams {
            session_name: self.config.session_name.clone(),
            credentials,
            auth: self.auth.clone(),
        };

        let timeout = self.config.connect_timeout;
        let events = match tokio::time::timeout(timeout, transport.connect(params)).await {
            Ok(Ok(events)) => events,
            Ok(Err(err)) => {
                release(transport).await;
                return Err(err.into());
            }
            Err(_) => {
                release(transport).await;
                return Err(ConnectionError::ConnectTimeout(timeout));
            }
        };

        if !self.is_current(generation) {
            release(transport).await;
            return Err(ConnectionError::Superseded);
        }
        *lock(&self.transport) = Some(transport);
        self.spawn_pump(generation, events);
        Ok(())
    }

    fn spawn_pump(self: &Arc<Self>, generation: u64, mut events: mpsc::Receiver<TransportEvent>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.is_current(generation) {
                    debug!("dropping event from a replaced transport");
                    return;
                }
                if inner.handle_event(generation, event).await.is_break() {
                    return;
                }
            }
            if let Some(inner) = weak.upgrade() {
                let reason = DisconnectReason::NetworkError("transport event stream ended".into());
                inner.link_lost(generation, reason).await;
            }
        });
        self.pump.replace(handle);
    }

    async fn handle_event(
        self: &Arc<Self>,
        generation: u64,
        event: TransportEvent,
    ) -> ControlFlow<()> {
        match event {
            TransportEvent::Qr(code) => self.on_qr(&code),
            TransportEvent::Connection(ConnectionUpdate::Authenticated) => {
                self.transition(ConnectionStatus::Authenticated, None);
            }
            TransportEvent::Connection(ConnectionUpdate::Open { me }) => {
                self.on_open(generation, me)
            }
            TransportEvent::Connection(ConnectionUpdate::Closed(DisconnectReason::LoggedOut)) => {
                self.logged_out(generation).await;
                return ControlFlow::Break(());
            }
            TransportEvent::Connection(ConnectionUpdate::Closed(reason)) => {
                self.link_lost(generation, reason).await;
                return ControlFlow::Break(());
            }
            TransportEvent::CredentialsUpdate(credentials) => self.on_credentials(credentials),
            TransportEvent::Message(message) => {
                self.events.publish(ConnectorEvent::MessageReceived(message))
            }
        }
        ControlFlow::Continue(())
    }

    fn on_qr(self: &Arc<Self>, code: &str) {
        let status = self.status();
        if !status.can_transition_to(ConnectionStatus::QrReady) {
            debug!("[{}] ignoring QR code while {status}", self.config.session_name);
            return;
        }

        match self.qr.issue(code, Utc::now()) {
            Ok(artifact) => {
                self.cache_qr(&artifact);
                self.transition(ConnectionStatus::QrReady, None);
                self.events.publish(ConnectorEvent::QrCode(artifact));
            }
            Err(err) => error!("[{}] {err}", self.config.session_name),
        }
    }

    fn on_open(self: &Arc<Self>, generation: u64, me: Option<String>) {
        if let Some(me) = me {
            let mut latest = lock(&self.latest_credentials);
            if let Some(credentials) = latest.as_mut() {
                if credentials.me.as_deref() != Some(me.as_str()) || !credentials.registered {
                    credentials.me = Some(me);
                    credentials.registered = true;
                    if let Err(err) = self.auth.save(credentials) {
                        warn!("[{}] failed to persist account id: {err}", self.config.session_name);
                    }
                }
            }
        }

        if self.transition(ConnectionStatus::Ready, None) {
            self.health.replace(health::spawn(
                Arc::downgrade(self),
                generation,
                self.config.health_interval,
                self.config.probe_timeout,
            ));
            self.backup
                .replace(backup::spawn(Arc::downgrade(self), self.config.backup_interval));
        }
    }

    fn on_credentials(&self, credentials: Credentials) {
        if let Err(err) = self.auth.save(&credentials) {
            warn!("[{}] failed to persist credentials: {err}", self.config.session_name);
        }
        *lock(&self.latest_credentials) = Some(credentials);
    }

    /// The link of `generation` is gone: release it and go `DISCONNECTED`.
    pub(super) async fn link_lost(self: &Arc<Self>, generation: u64, reason: DisconnectReason) {
        if !self.invalidate(generation) {
            debug!("ignoring link loss of a replaced transport");
            return;
        }
        warn!("[{}] link lost: {reason:?}", self.config.session_name);
        self.stop_background();
        if let Some(transport) = self.take_transport() {
            release(transport).await;
        }
        self.transition(ConnectionStatus::Disconnected, Some(reason));
    }

    pub(super) async fn logged_out(self: &Arc<Self>, generation: u64) {
        if !self.invalidate(generation) {
            return;
        }
        warn!(
            "[{}] logged out by the network, discarding credentials",
            self.config.session_name
        );
        self.scheduler.cancel();
        self.stop_background();
        if let Some(transport) = self.take_transport() {
            release(transport).await;
        }
        self.clear_qr();
        if let Err(err) = self.auth.clear() {
            error!("[{}] failed to clear credentials: {err}", self.config.session_name);
        }
        *lock(&self.latest_credentials) = None;
        self.transition(ConnectionStatus::AuthFailure, Some(DisconnectReason::LoggedOut));
    }

    async fn teardown(&self) {
        self.scheduler.cancel();
        self.stop_background();
        self.persist_snapshot();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(transport) = self.take_transport() {
            release(transport).await;
        }
        self.pump.abort();
    }

    async fn stop_manually(self: &Arc<Self>) {
        self.manual.store(true, Ordering::SeqCst);
        self.teardown().await;
        self.clear_qr();
        self.transition(ConnectionStatus::Disconnected, Some(DisconnectReason::Manual));
    }

    /// Move to `next` and apply its side effects. Returns whether it moved.
    pub(super) fn transition(
        self: &Arc<Self>,
        next: ConnectionStatus,
        reason: Option<DisconnectReason>,
    ) -> bool {
        let (from, attempts) = {
            let mut session = self.session();
            let from = session.status;
            if from == next && next != ConnectionStatus::QrReady {
                return false;
            }
            if !from.can_transition_to(next) {
                warn!("[{}] rejected transition {from} -> {next}", session.session_name);
                return false;
            }
            session.status = next;
            if next == ConnectionStatus::Ready {
                session.reconnect_attempts = 0;
            }
            session.last_updated_at = Utc::now();
            (from, session.reconnect_attempts)
        };

        info!("[{}] {from} -> {next}", self.config.session_name);
        self.persist_snapshot();
        if matches!(next, ConnectionStatus::Authenticated | ConnectionStatus::Ready) {
            self.clear_qr();
        }
        self.events.publish(ConnectorEvent::StatusChanged {
            from,
            to: next,
            reconnect_attempts: attempts,
            reason: reason.clone(),
        });

        if next == ConnectionStatus::Disconnected {
            let manual = self.manual.load(Ordering::SeqCst)
                || reason.as_ref().is_some_and(|reason| !reason.should_reconnect());
            if !manual {
                self.schedule_reconnect();
            }
        }
        true
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let attempt = {
            let mut session = self.session();
            session.reconnect_attempts = session.reconnect_attempts.saturating_add(1);
            session.reconnect_attempts
        };
        let name = &self.config.session_name;
        let weak = Arc::downgrade(self);

        match self.backoff.next(attempt) {
            Backoff::Retry(delay) => {
                info!("[{name}] reconnecting in {delay:?} (attempt {attempt})");
                self.events.publish(ConnectorEvent::ReconnectScheduled {
                    attempt,
                    delay,
                    cooldown: false,
                });
                self.scheduler.schedule(delay, async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.initialize().await;
                    }
                });
            }
            Backoff::Cooldown(delay) => {
                warn!("[{name}] {attempt} consecutive failures, cooling down for {delay:?}");
                self.events.publish(ConnectorEvent::ReconnectScheduled {
                    attempt,
                    delay,
                    cooldown: true,
                });
                self.scheduler.schedule(delay, async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.session().reconnect_attempts = 0;
                        inner.persist_snapshot();
                        inner.initialize().await;
                    }
                });
            }
        }
    }

    /// Best effort: a failing store never blocks a transition.
    pub(super) fn persist_snapshot(&self) {
        let snapshot = self.session().clone();
        let result = serde_json::to_string(&snapshot)
            .map_err(Into::into)
            .and_then(|json| self.store.set(&self.keys.status(), &json, None));
        if let Err(err) = result {
            warn!("[{}] failed to persist status snapshot: {err}", snapshot.session_name);
        }
    }

    fn cache_qr(&self, artifact: &QrArtifact) {
        let result = serde_json::to_string(artifact)
            .map_err(Into::into)
            .and_then(|json| self.store.set(&self.keys.qr(), &json, Some(self.qr.window())));
        if let Err(err) = result {
            warn!("[{}] failed to cache QR code: {err}", self.config.session_name);
        }
    }

    fn clear_qr(&self) {
        if self.qr.clear() {
            if let Err(err) = self.store.del(&self.keys.qr()) {
                warn!("[{}] failed to drop cached QR code: {err}", self.config.session_name);
            }
        }
    }

    fn stop_background(&self) {
        self.health.abort();
        self.backup.abort();
    }

    /// Mark `generation` as done. False if it was already replaced.
    fn invalidate(&self, generation: u64) -> bool {
        self.generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub(super) fn status(&self) -> ConnectionStatus {
        self.session().status
    }

    fn session(&self) -> MutexGuard<'_, ConnectionSession> {
        lock(&self.session)
    }

    pub(super) fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.transport).clone()
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.transport).take()
    }
}

/// Holds the "is connecting" flag; releases it even when the attempt is
/// cancelled mid-connect.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl<'a> ConnectingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::SeqCst)).then_some(Self(flag))
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn release(transport: Arc<dyn Transport>) {
    match tokio::time::timeout(DESTROY_TIMEOUT, transport.destroy()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("failed to destroy {} transport: {err}", transport.name()),
        Err(_) => warn!("{} transport did not shut down in time", transport.name()),
    }
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::mock::{MockFactory, MockTransport};
    use crate::transport::LinkHealth;
    use crate::types::InboundMessage;
    use tokio::sync::broadcast;

    fn config() -> ConnectorConfig {
        ConnectorConfig::default().with_session_name("test")
    }

    fn manager_with(config: ConnectorConfig) -> (ConnectionManager, Arc<MockTransport>, Arc<MemoryStore>) {
        let mock = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let manager = ConnectionManager::new(
            config,
            Arc::new(MockFactory(mock.clone())),
            store.clone(),
            EventBus::default(),
        );
        (manager, mock, store)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        let reached = tokio::time::timeout(Duration::from_secs(120), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "condition never became true");
    }

    async fn wait_for(manager: &ConnectionManager, status: ConnectionStatus) {
        eventually(|| manager.status() == status).await;
    }

    async fn ready(manager: &ConnectionManager, mock: &MockTransport) {
        manager.initialize().await;
        mock.emit(TransportEvent::Connection(ConnectionUpdate::Open {
            me: Some("5543991402403@s.whatsapp.net".into()),
        }))
        .await;
        wait_for(manager, ConnectionStatus::Ready).await;
    }

    fn statuses(events: &mut broadcast::Receiver<ConnectorEvent>) -> Vec<ConnectionStatus> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectorEvent::StatusChanged { to, .. } = event {
                seen.push(to);
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_qr_pairing_path_to_ready() {
        let (manager, mock, store) = manager_with(config());
        let mut events = manager.events().subscribe();

        manager.initialize().await;
        assert_eq!(manager.status(), ConnectionStatus::Connecting);

        mock.emit(TransportEvent::Qr("2@pair".into())).await;
        wait_for(&manager, ConnectionStatus::QrReady).await;
        assert_eq!(manager.qr_code().unwrap().value, "2@pair");
        assert!(manager.report().has_qr_code);
        assert!(store.exists("wa:test:qr").unwrap());

        mock.emit(TransportEvent::Connection(ConnectionUpdate::Authenticated))
            .await;
        wait_for(&manager, ConnectionStatus::Authenticated).await;
        assert!(manager.qr_code().is_none());

        mock.emit(TransportEvent::Connection(ConnectionUpdate::Open { me: None }))
            .await;
        wait_for(&manager, ConnectionStatus::Ready).await;

        let report = manager.report();
        assert!(!report.has_qr_code);
        assert_eq!(report.qr_expiry, None);
        assert!(!store.exists("wa:test:qr").unwrap());
        assert_eq!(
            statuses(&mut events),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::QrReady,
                ConnectionStatus::Authenticated,
                ConnectionStatus::Ready,
            ]
        );
    }

    #[tokio::test]
    async fn test_qr_gone_once_ready_before_expiry() {
        let (manager, mock, _store) = manager_with(config());
        manager.initialize().await;
        mock.emit(TransportEvent::Qr("2@pair".into())).await;
        wait_for(&manager, ConnectionStatus::QrReady).await;

        mock.emit(TransportEvent::Connection(ConnectionUpdate::Open { me: None }))
            .await;
        wait_for(&manager, ConnectionStatus::Ready).await;
        assert!(manager.qr_code().is_none());
    }

    #[tokio::test]
    async fn test_status_snapshot_and_account_id_persisted() {
        let (manager, mock, store) = manager_with(config());
        ready(&manager, &mock).await;

        let snapshot: ConnectionSession =
            serde_json::from_str(&store.get("wa:test:status").unwrap().unwrap()).unwrap();
        assert_eq!(snapshot.status, ConnectionStatus::Ready);
        assert_eq!(snapshot.reconnect_attempts, 0);

        let credentials = manager.auth().load();
        assert!(credentials.is_registered());
        assert_eq!(
            credentials.me.as_deref(),
            Some("5543991402403@s.whatsapp.net")
        );
    }

    #[tokio::test]
    async fn test_initialize_while_connecting_is_noop() {
        let (manager, mock, _store) = manager_with(config());
        mock.hang_connect(true);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.initialize().await })
        };
        while mock.connects() == 0 {
            tokio::task::yield_now().await;
        }

        manager.initialize().await;
        assert_eq!(mock.connects(), 1);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_initialize_does_not_block_reconnect() {
        let (manager, mock, _store) = manager_with(config());
        mock.hang_connect(true);

        let cancelled = tokio::time::timeout(Duration::from_secs(1), manager.initialize()).await;
        assert!(cancelled.is_err());
        assert!(!manager.inner.connecting.load(Ordering::SeqCst));

        mock.hang_connect(false);
        manager.reconnect().await;
        assert_eq!(mock.connects(), 2);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);

        mock.emit(TransportEvent::Connection(ConnectionUpdate::Open { me: None }))
            .await;
        wait_for(&manager, ConnectionStatus::Ready).await;
    }

    #[tokio::test]
    async fn test_initialize_while_live_is_noop() {
        let (manager, mock, _store) = manager_with(config());
        ready(&manager, &mock).await;
        manager.initialize().await;
        assert_eq!(mock.connects(), 1);
        assert_eq!(manager.status(), ConnectionStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_schedules_reconnect() {
        let (manager, mock, _store) = manager_with(config());
        mock.push_connect(Err(TransportError::Network("refused".into())));
        let mut events = manager.events().subscribe();

        manager.initialize().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.session().reconnect_attempts, 1);
        assert!(manager.is_reconnect_pending());

        let scheduled = loop {
            if let ConnectorEvent::ReconnectScheduled { attempt, delay, cooldown } =
                events.recv().await.unwrap()
            {
                break (attempt, delay, cooldown);
            }
        };
        assert_eq!(scheduled, (1, Duration::from_secs(2), false));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mock.connects(), 2);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let (manager, mock, _store) = manager_with(config());
        mock.hang_connect(true);

        manager.initialize().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(mock.destroys(), 1);
        assert!(manager.is_reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_after_max_failures() {
        let (manager, mock, _store) = manager_with(config());
        for _ in 0..8 {
            mock.push_connect(Err(TransportError::Network("refused".into())));
        }
        let mut events = manager.events().subscribe();

        manager.initialize().await;

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                ConnectorEvent::ReconnectScheduled {
                    attempt,
                    delay,
                    cooldown: false,
                } => {
                    assert_eq!(attempt as usize, delays.len() + 1);
                    delays.push(delay);
                }
                ConnectorEvent::ReconnectScheduled {
                    attempt,
                    delay,
                    cooldown: true,
                } => {
                    assert_eq!(attempt, 8);
                    assert_eq!(delay, Duration::from_secs(300));
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(delays.len(), 7);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
        assert_eq!(mock.connects(), 8);
        assert_eq!(manager.session().reconnect_attempts, 8);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(mock.connects(), 8);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mock.connects(), 9);
        assert_eq!(manager.session().reconnect_attempts, 0);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_reconnects() {
        let (manager, mock, _store) = manager_with(config());
        ready(&manager, &mock).await;
        assert!(manager.inner.health.is_running());
        assert!(manager.inner.backup.is_running());

        mock.emit(TransportEvent::Connection(ConnectionUpdate::Closed(
            DisconnectReason::NetworkError("reset".into()),
        )))
        .await;
        wait_for(&manager, ConnectionStatus::Disconnected).await;
        assert!(!manager.inner.health.is_running());
        assert!(!manager.inner.backup.is_running());
        assert_eq!(manager.session().reconnect_attempts, 1);
        assert_eq!(mock.destroys(), 1);
        assert!(manager.ready_transport().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mock.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_is_terminal() {
        let (manager, mock, _store) = manager_with(config());
        ready(&manager, &mock).await;
        assert!(manager.auth().has_credentials());

        mock.emit(TransportEvent::Connection(ConnectionUpdate::Closed(
            DisconnectReason::LoggedOut,
        )))
        .await;
        wait_for(&manager, ConnectionStatus::AuthFailure).await;

        assert!(!manager.auth().has_credentials());
        assert!(!manager.is_reconnect_pending());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(mock.connects(), 1);
        assert_eq!(manager.status(), ConnectionStatus::AuthFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_probe_timeout_is_link_loss() {
        let config = config().with_health_check(Duration::from_secs(30), Duration::from_secs(10));
        let (manager, mock, _store) = manager_with(config);
        let mut events = manager.events().subscribe();
        ready(&manager, &mock).await;

        mock.hang_probe(true);
        wait_for(&manager, ConnectionStatus::Disconnected).await;

        let reason = loop {
            if let ConnectorEvent::StatusChanged {
                to: ConnectionStatus::Disconnected,
                reason,
                ..
            } = events.recv().await.unwrap()
            {
                break reason;
            }
        };
        assert!(matches!(reason, Some(DisconnectReason::HealthCheckFailed(_))));
        assert!(manager.is_reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_probe_is_link_loss() {
        let (manager, mock, _store) = manager_with(config());
        ready(&manager, &mock).await;

        mock.set_probe(Ok(LinkHealth::Degraded("PAIRING".into())));
        wait_for(&manager, ConnectionStatus::Disconnected).await;
        assert_eq!(mock.destroys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_probe_is_terminal() {
        let (manager, mock, _store) = manager_with(config());
        ready(&manager, &mock).await;

        mock.set_probe(Err(TransportError::LoggedOut("401".into())));
        wait_for(&manager, ConnectionStatus::AuthFailure).await;
        assert!(!manager.auth().has_credentials());
        assert!(!manager.is_reconnect_pending());
        assert_eq!(mock.destroys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_probe_keeps_ready() {
        let (manager, mock, _store) = manager_with(config());
        ready(&manager, &mock).await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(manager.status(), ConnectionStatus::Ready);
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_manual() {
        let (manager, mock, _store) = manager_with(config());
        ready(&manager, &mock).await;

        manager.disconnect().await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(mock.destroys(), 1);
        assert!(!manager.is_reconnect_pending());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(mock.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_attempts() {
        let (manager, mock, _store) = manager_with(config());
        mock.push_connect(Err(TransportError::Network("refused".into())));
        manager.initialize().await;
        assert_eq!(manager.session().reconnect_attempts, 1);

        manager.reconnect().await;
        assert_eq!(manager.session().reconnect_attempts, 0);
        assert_eq!(mock.connects(), 2);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        assert!(!manager.is_reconnect_pending());
    }

    #[tokio::test]
    async fn test_logout_clears_credentials() {
        let (manager, mock, _store) = manager_with(config());
        ready(&manager, &mock).await;

        manager.logout().await.unwrap();
        assert!(!manager.auth().has_credentials());
        assert_eq!(manager.session().status, ConnectionStatus::Disconnected);
        assert!(!manager.is_reconnect_pending());
    }

    #[tokio::test]
    async fn test_credentials_update_is_persisted() {
        let (manager, mock, _store) = manager_with(config());
        manager.initialize().await;

        let mut credentials = Credentials::generate();
        credentials.registered = true;
        mock.emit(TransportEvent::CredentialsUpdate(credentials.clone()))
            .await;

        eventually(|| manager.auth().has_credentials()).await;
        assert_eq!(manager.auth().load(), credentials);
    }

    #[tokio::test]
    async fn test_inbound_messages_are_forwarded() {
        let (manager, mock, _store) = manager_with(config());
        let mut events = manager.events().subscribe();
        ready(&manager, &mock).await;

        let message = InboundMessage {
            id: "IN1".into(),
            from: "5543991402403@s.whatsapp.net".into(),
            body: "ok".into(),
            timestamp: Utc::now(),
        };
        mock.emit(TransportEvent::Message(message.clone())).await;

        let received = loop {
            if let ConnectorEvent::MessageReceived(received) = events.recv().await.unwrap() {
                break received;
            }
        };
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_ready_transport_only_when_ready() {
        let (manager, mock, _store) = manager_with(config());
        assert_eq!(
            manager.ready_transport().err(),
            Some(ConnectionStatus::Disconnected)
        );
        manager.initialize().await;
        assert_eq!(
            manager.ready_transport().err(),
            Some(ConnectionStatus::Connecting)
        );
        mock.emit(TransportEvent::Connection(ConnectionUpdate::Open { me: None }))
            .await;
        wait_for(&manager, ConnectionStatus::Ready).await;
        assert!(manager.ready_transport().is_ok());
    }
}
