//! Native driver: frame protocol over a WebSocket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::transport::link::{address, stream_closed, RpcLink};
use crate::transport::{
    ConnectParams, LinkHealth, Transport, TransportError, TransportEvent, EVENT_BUFFER,
};
use crate::types::servers;

/// Time allowed for the `close` request while tearing down.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

struct Live {
    link: Arc<RpcLink>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Transport speaking JSON frames over a WebSocket endpoint.
pub struct WebSocketTransport {
    endpoint: String,
    call_timeout: Duration,
    live: Mutex<Option<Live>>,
}

impl WebSocketTransport {
    pub fn new(endpoint: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            call_timeout,
            live: Mutex::new(None),
        }
    }

    fn link(&self) -> Result<Arc<RpcLink>, TransportError> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|live| live.link.clone())
            .ok_or(TransportError::NotConnected)
    }

    async fn open(
        &self,
        params: ConnectParams,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        info!("connecting to {}", self.endpoint);
        let (ws, _response) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let link = Arc::new(RpcLink::new(outbound_tx, self.call_timeout));

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!("websocket write failed: {err}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let link = link.clone();
            let auth = params.auth.clone();
            tokio::spawn(async move {
                let detail = loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => {
                            link.route(&text, &events_tx, &auth).await
                        }
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => link.route(&text, &events_tx, &auth).await,
                            Err(_) => debug!("dropping non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|frame| format!("closed: {}", frame.reason));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break Some(err.to_string()),
                        None => break None,
                    }
                };
                link.fail_pending("websocket closed");
                let _ = events_tx.send(stream_closed(detail)).await;
            })
        };

        let previous = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(Live {
                link: link.clone(),
                reader,
                writer,
            });
        if let Some(previous) = previous {
            previous.reader.abort();
            previous.writer.abort();
        }

        link.open_session(&params.session_name, &params.credentials)
            .await?;
        Ok(events_rx)
    }
}

impl Transport for WebSocketTransport {
    fn connect(
        &self,
        params: ConnectParams,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<TransportEvent>, TransportError>> {
        Box::pin(self.open(params))
    }

    fn send_message<'a>(
        &'a self,
        recipient: &'a str,
        body: &'a str,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let to = address(recipient, servers::DEFAULT_USER);
            self.link()?.send_text(&to, body).await
        })
    }

    fn lookup<'a>(&'a self, phone: &'a str) -> BoxFuture<'a, Result<Option<String>, TransportError>> {
        Box::pin(async move { self.link()?.lookup(phone).await })
    }

    fn repair_session<'a>(&'a self, recipient: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let to = address(recipient, servers::DEFAULT_USER);
            self.link()?.repair_session(&to).await
        })
    }

    fn probe(&self) -> BoxFuture<'_, Result<LinkHealth, TransportError>> {
        Box::pin(async move { self.link()?.state().await })
    }

    fn destroy(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let live = self
                .live
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            let Some(live) = live else {
                return Ok(());
            };

            if tokio::time::timeout(CLOSE_GRACE, live.link.call("close", Value::Null))
                .await
                .is_err()
            {
                debug!("peer did not acknowledge close");
            }
            live.link.fail_pending("transport destroyed");
            live.reader.abort();
            live.writer.abort();
            info!("websocket transport destroyed");
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthState, Credentials, MemoryStore, StoreKeys};
    use crate::transport::{ConnectionUpdate, TransportEvent};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn params() -> ConnectParams {
        ConnectParams {
            session_name: "ws-test".into(),
            credentials: Credentials::generate(),
            auth: Arc::new(AuthState::new(
                Arc::new(MemoryStore::new()),
                StoreKeys::new("wa", "ws-test"),
                Duration::from_secs(60),
                None,
            )),
        }
    }

    /// Minimal peer: acknowledges every request, emits a QR on connect,
    /// answers `send` with a fixed id.
    async fn spawn_peer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(&text).unwrap();
                let id = request["id"].clone();
                let result = match request["method"].as_str() {
                    Some("send") => json!({ "id": "ABC123" }),
                    Some("state") => json!({ "state": "CONNECTED" }),
                    _ => Value::Null,
                };
                ws.send(Message::Text(json!({ "id": id, "result": result }).to_string()))
                    .await
                    .unwrap();
                if request["method"] == "connect" {
                    ws.send(Message::Text(
                        json!({ "event": "qr", "data": { "code": "2@pair" } }).to_string(),
                    ))
                    .await
                    .unwrap();
                }
                if request["method"] == "close" {
                    break;
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let endpoint = spawn_peer().await;
        let transport = WebSocketTransport::new(endpoint, Duration::from_secs(5));

        let mut events = transport.connect(params()).await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Qr("2@pair".into())));

        assert_eq!(
            transport.send_message("5543991402403", "hi").await.unwrap(),
            "ABC123"
        );
        assert_eq!(transport.probe().await.unwrap(), LinkHealth::Connected);

        transport.destroy().await.unwrap();
        assert_eq!(
            transport.send_message("5543991402403", "hi").await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_websocket_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(&text).unwrap();
                ws.send(Message::Text(json!({ "id": request["id"], "result": null }).to_string()))
                    .await
                    .unwrap();
            }
            ws.close(None).await.unwrap();
        });

        let transport = WebSocketTransport::new(format!("ws://{addr}"), Duration::from_secs(5));
        let mut events = transport.connect(params()).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Connection(ConnectionUpdate::Closed(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1", Duration::from_secs(1));
        assert!(matches!(
            transport.connect(params()).await,
            Err(TransportError::Network(_))
        ));
    }
}
