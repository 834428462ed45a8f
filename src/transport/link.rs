//! Request/response correlation over a frame link.
//!
//! Both drivers own a reader task that feeds raw text frames into
//! [`RpcLink::route`] and a writer task that drains the outbound queue.
//! Outgoing calls get a sequential id and wait on a oneshot channel until the
//! matching response arrives or the call times out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::store::{AuthState, Credentials};
use crate::transport::frame::{
    ConnectionUpdateData, CredsUpdateData, EventFrame, Frame, KeysGetParams, KeysSetParams,
    LookupResult, MessageData, QrData, Request, Response, SendResult, StateResult,
};
use crate::transport::{ConnectionUpdate, LinkHealth, TransportError, TransportEvent};
use crate::types::{DisconnectReason, InboundMessage, Jid};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>>;

/// JSON-RPC style link shared by the native and bridge drivers.
pub struct RpcLink {
    outbound: mpsc::UnboundedSender<String>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
}

impl RpcLink {
    pub fn new(outbound: mpsc::UnboundedSender<String>, timeout: Duration) -> Self {
        Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Issue a request and wait (bounded) for its response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id, tx);

        let frame = Frame::Request(Request {
            id,
            method: method.to_string(),
            params,
        });
        if let Err(err) = self.write(&frame) {
            self.pending_map().remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Network("link closed before response".into())),
            Err(_) => {
                self.pending_map().remove(&id);
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, TransportError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|err| TransportError::Unknown(format!("malformed {method} response: {err}")))
    }

    /// Start the session on the peer with the given credentials.
    pub async fn open_session(
        &self,
        session_name: &str,
        credentials: &Credentials,
    ) -> Result<(), TransportError> {
        self.call(
            "connect",
            json!({ "session": session_name, "creds": credentials }),
        )
        .await
        .map(|_| ())
    }

    /// Send a text message; returns the network message id.
    pub async fn send_text(&self, to: &Jid, body: &str) -> Result<String, TransportError> {
        let result: SendResult = self
            .call_as("send", json!({ "to": to.to_string(), "body": body }))
            .await?;
        Ok(result
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string().to_uppercase()))
    }

    /// Registered id of `phone`, `None` when it is not on the network.
    pub async fn lookup(&self, phone: &str) -> Result<Option<String>, TransportError> {
        let result: LookupResult = self.call_as("lookup", json!({ "phone": phone })).await?;
        if !result.exists {
            return Ok(None);
        }
        Ok(Some(result.id.unwrap_or_else(|| phone.to_string())))
    }

    pub async fn repair_session(&self, to: &Jid) -> Result<(), TransportError> {
        self.call("session.repair", json!({ "to": to.to_string() }))
            .await
            .map(|_| ())
    }

    pub async fn state(&self) -> Result<LinkHealth, TransportError> {
        let result: StateResult = self.call_as("state", Value::Null).await?;
        Ok(match result.state.as_str() {
            "CONNECTED" | "open" => LinkHealth::Connected,
            other => LinkHealth::Degraded(other.to_string()),
        })
    }

    /// Route one inbound frame: complete a pending call, answer a peer
    /// request, or forward an event.
    pub async fn route(&self, text: &str, events: &mpsc::Sender<TransportEvent>, auth: &AuthState) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping malformed frame: {err}");
                return;
            }
        };

        match frame {
            Frame::Response(response) => self.complete(response),
            Frame::Request(request) => self.answer(request, auth),
            Frame::Event(event) => {
                if let Some(event) = translate_event(event) {
                    let _ = events.send(event).await;
                }
            }
        }
    }

    /// Fail every outstanding call; used when the link goes down.
    pub fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending_map().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(TransportError::Network(reason.to_string())));
        }
    }

    fn complete(&self, response: Response) {
        let Some(tx) = self.pending_map().remove(&response.id) else {
            debug!("response for unknown request {}", response.id);
            return;
        };
        let result = match response.error {
            Some(error) => Err(error.into()),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(result);
    }

    fn answer(&self, request: Request, auth: &AuthState) {
        let result = match request.method.as_str() {
            "keys.get" => serde_json::from_value::<KeysGetParams>(request.params)
                .map(|params| json!(auth.get_keys(&params.kind, &params.ids)))
                .map_err(|err| err.to_string()),
            "keys.set" => serde_json::from_value::<KeysSetParams>(request.params)
                .map_err(|err| err.to_string())
                .and_then(|params| auth.set_keys(&params.data).map_err(|err| err.to_string()))
                .map(|_| Value::Null),
            other => Err(format!("unsupported method {other}")),
        };

        let response = match result {
            Ok(result) => json!({ "id": request.id, "result": result }),
            Err(message) => json!({ "id": request.id, "error": { "message": message } }),
        };
        if let Err(err) = self.write_value(&response) {
            warn!("failed to answer {}: {err}", request.method);
        }
    }

    fn write(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)
            .map_err(|err| TransportError::Unknown(err.to_string()))?;
        self.outbound
            .send(text)
            .map_err(|_| TransportError::NotConnected)
    }

    fn write_value(&self, value: &Value) -> Result<(), TransportError> {
        self.outbound
            .send(value.to_string())
            .map_err(|_| TransportError::NotConnected)
    }

    fn pending_map(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>
    {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse<T: DeserializeOwned>(event: &str, data: Value) -> Option<T> {
    serde_json::from_value(data)
        .map_err(|err| warn!("malformed {event} event: {err}"))
        .ok()
}

/// Map a peer event frame onto a [`TransportEvent`].
pub fn translate_event(frame: EventFrame) -> Option<TransportEvent> {
    match frame.event.as_str() {
        "qr" => parse::<QrData>("qr", frame.data).map(|qr| TransportEvent::Qr(qr.code)),
        "connection.update" => {
            let update = parse::<ConnectionUpdateData>("connection.update", frame.data)?;
            let update = match update.state.as_str() {
                "authenticated" => ConnectionUpdate::Authenticated,
                "open" | "ready" => ConnectionUpdate::Open { me: update.me },
                "close" => ConnectionUpdate::Closed(update.close_reason()),
                other => {
                    debug!("ignoring connection state {other}");
                    return None;
                }
            };
            Some(TransportEvent::Connection(update))
        }
        "creds.update" => parse::<CredsUpdateData>("creds.update", frame.data)
            .map(|data| TransportEvent::CredentialsUpdate(data.creds)),
        "message" => parse::<MessageData>("message", frame.data).map(|data| {
            let timestamp = data
                .timestamp
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .unwrap_or_else(Utc::now);
            TransportEvent::Message(InboundMessage {
                id: data.id,
                from: data.from,
                body: data.body,
                timestamp,
            })
        }),
        other => {
            debug!("ignoring event {other}");
            None
        }
    }
}

/// Address for `recipient`: a full id is kept, bare digits go on `server`.
pub fn address(recipient: &str, server: &str) -> Jid {
    if recipient.contains('@') {
        if let Ok(jid) = recipient.parse::<Jid>() {
            return jid.to_non_device();
        }
    }
    Jid::user(recipient, server)
}

/// Reason reported when a reader loop ends without a close event.
pub fn stream_closed(detail: Option<String>) -> TransportEvent {
    TransportEvent::Connection(ConnectionUpdate::Closed(match detail {
        Some(detail) => DisconnectReason::NetworkError(detail),
        None => DisconnectReason::NetworkError("stream ended".into()),
    }))
}
