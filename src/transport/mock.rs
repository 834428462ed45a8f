//! Scriptable in-process transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::transport::{
    ConnectParams, LinkHealth, Transport, TransportError, TransportEvent, TransportFactory,
};

#[derive(Default)]
struct Script {
    connect_results: VecDeque<Result<(), TransportError>>,
    send_results: HashMap<String, VecDeque<Result<String, TransportError>>>,
    lookups: HashMap<String, Option<String>>,
    lookup_error: Option<TransportError>,
    probe_result: Option<Result<LinkHealth, TransportError>>,
    sends: Vec<(String, String)>,
    repairs: Vec<String>,
    events: Option<mpsc::Sender<TransportEvent>>,
}

/// Transport whose behaviour is scripted by the test.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
    hang_probe: AtomicBool,
    hang_connect: AtomicBool,
    connects: AtomicUsize,
    destroys: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Queue the outcome of the next `connect` (default: success).
    pub fn push_connect(&self, result: Result<(), TransportError>) {
        self.script().connect_results.push_back(result);
    }

    /// Queue the outcome of the next send to `recipient` (default: success).
    pub fn push_send(&self, recipient: &str, result: Result<String, TransportError>) {
        self.script()
            .send_results
            .entry(recipient.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn set_lookup(&self, phone: &str, id: Option<&str>) {
        self.script()
            .lookups
            .insert(phone.to_string(), id.map(str::to_string));
    }

    pub fn fail_lookups(&self, err: TransportError) {
        self.script().lookup_error = Some(err);
    }

    pub fn set_probe(&self, result: Result<LinkHealth, TransportError>) {
        self.script().probe_result = Some(result);
    }

    pub fn hang_probe(&self, hang: bool) {
        self.hang_probe.store(hang, Ordering::SeqCst);
    }

    pub fn hang_connect(&self, hang: bool) {
        self.hang_connect.store(hang, Ordering::SeqCst);
    }

    /// Push an event as if the link produced it.
    pub async fn emit(&self, event: TransportEvent) {
        let tx = self.script().events.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Recipients of every send call, in order.
    pub fn sent_to(&self) -> Vec<String> {
        self.script().sends.iter().map(|(to, _)| to.clone()).collect()
    }

    pub fn repairs(&self) -> Vec<String> {
        self.script().repairs.clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        _params: ConnectParams,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<TransportEvent>, TransportError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.hang_connect.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            let result = self.script().connect_results.pop_front().unwrap_or(Ok(()));
            result?;
            let (tx, rx) = mpsc::channel(64);
            self.script().events = Some(tx);
            Ok(rx)
        })
    }

    fn send_message<'a>(
        &'a self,
        recipient: &'a str,
        body: &'a str,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let mut script = self.script();
            script.sends.push((recipient.to_string(), body.to_string()));
            let count = script.sends.len();
            script
                .send_results
                .get_mut(recipient)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(format!("MOCK{count}")))
        })
    }

    fn lookup<'a>(&'a self, phone: &'a str) -> BoxFuture<'a, Result<Option<String>, TransportError>> {
        Box::pin(async move {
            let script = self.script();
            if let Some(err) = &script.lookup_error {
                return Err(err.clone());
            }
            Ok(script
                .lookups
                .get(phone)
                .cloned()
                .unwrap_or_else(|| Some(phone.to_string())))
        })
    }

    fn repair_session<'a>(&'a self, recipient: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.script().repairs.push(recipient.to_string());
            Ok(())
        })
    }

    fn probe(&self) -> BoxFuture<'_, Result<LinkHealth, TransportError>> {
        Box::pin(async move {
            if self.hang_probe.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            self.script()
                .probe_result
                .clone()
                .unwrap_or(Ok(LinkHealth::Connected))
        })
    }

    fn destroy(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            self.script().events = None;
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Factory handing out the same mock for every attempt.
pub struct MockFactory(pub Arc<MockTransport>);

impl TransportFactory for MockFactory {
    fn create(&self) -> Arc<dyn Transport> {
        self.0.clone()
    }
}
