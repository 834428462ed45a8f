//! JSON frames spoken by both drivers.
//!
//! ```json
//! {"id": 7, "method": "send", "params": {"to": "5543991402403@c.us", "body": "hi"}}
//! {"id": 7, "result": {"id": "3EB0C767D26A1D8C"}}
//! {"id": 7, "error": {"code": "no-session", "message": "No sessions"}}
//! {"event": "qr", "data": {"code": "2@abc..."}}
//! ```
//!
//! Requests flow both ways: the peer asks for key material with
//! `keys.get`/`keys.set` while it encrypts and decrypts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::Credentials;
use crate::transport::TransportError;
use crate::types::DisconnectReason;

/// Any frame on the link. Variant order matters for untagged matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Event(EventFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

impl From<ErrorBody> for TransportError {
    fn from(body: ErrorBody) -> Self {
        TransportError::classify(body.code.as_deref(), &body.message)
            .with_retry_after(body.retry_after_ms.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of the `connection.update` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionUpdateData {
    pub state: String,
    #[serde(default)]
    pub me: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ConnectionUpdateData {
    pub fn close_reason(&self) -> DisconnectReason {
        match self.reason.as_deref() {
            Some("logged_out") | Some("logged-out") | Some("401") => DisconnectReason::LoggedOut,
            Some("replaced") | Some("440") => DisconnectReason::Replaced,
            Some("server") | Some("restart_required") | Some("515") => {
                DisconnectReason::ServerRequested
            }
            Some(other) => DisconnectReason::NetworkError(other.to_string()),
            None => DisconnectReason::Unknown,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QrData {
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredsUpdateData {
    pub creds: Credentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageData {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeysGetParams {
    #[serde(rename = "type")]
    pub kind: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeysSetParams {
    pub data: crate::store::KeyBatch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupResult {
    pub exists: bool,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendResult {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateResult {
    pub state: String,
}
