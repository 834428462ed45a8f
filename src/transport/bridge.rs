//! Browser driver: a headless web-client helper process spoken to over stdio.
//!
//! The helper reads one JSON frame per line on stdin and writes one per line
//! on stdout. Its stderr is passed through. The web client cannot interleave
//! sends, so sends are serialized through a single slot.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::link::{address, stream_closed, RpcLink};
use crate::transport::{
    ConnectParams, LinkHealth, Transport, TransportError, TransportEvent, EVENT_BUFFER,
};
use crate::types::servers;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

struct Live {
    link: Arc<RpcLink>,
    child: Child,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Transport driving a web-client helper process.
pub struct BridgeTransport {
    command: String,
    args: Vec<String>,
    call_timeout: Duration,
    live: Mutex<Option<Live>>,
    send_slot: tokio::sync::Mutex<()>,
}

impl BridgeTransport {
    pub fn new(command: impl Into<String>, args: Vec<String>, call_timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            call_timeout,
            live: Mutex::new(None),
            send_slot: tokio::sync::Mutex::new(()),
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
        info!("starting bridge {} {:?}", self.command, self.args);
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TransportError::Network(format!("failed to start bridge: {err}")))?;

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Network("bridge stdio unavailable".into()));
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let link = Arc::new(RpcLink::new(outbound_tx, self.call_timeout));

        let writer = tokio::spawn(async move {
            while let Some(mut line) = outbound_rx.recv().await {
                line.push('\n');
                if let Err(err) = stdin.write_all(line.as_bytes()).await {
                    warn!("bridge write failed: {err}");
                    break;
                }
                if let Err(err) = stdin.flush().await {
                    warn!("bridge flush failed: {err}");
                    break;
                }
            }
        });

        let reader = {
            let link = link.clone();
            let auth = params.auth.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let detail = loop {
                    match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => {}
                        Ok(Some(line)) => link.route(&line, &events_tx, &auth).await,
                        Ok(None) => break Some("bridge exited".to_string()),
                        Err(err) => break Some(err.to_string()),
                    }
                };
                link.fail_pending("bridge closed");
                let _ = events_tx.send(stream_closed(detail)).await;
            })
        };

        let previous = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(Live {
                link: link.clone(),
                child,
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

impl Transport for BridgeTransport {
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
            let link = self.link()?;
            let _slot = self.send_slot.lock().await;
            let to = address(recipient, servers::LEGACY_USER);
            link.send_text(&to, body).await
        })
    }

    fn lookup<'a>(&'a self, phone: &'a str) -> BoxFuture<'a, Result<Option<String>, TransportError>> {
        Box::pin(async move { self.link()?.lookup(phone).await })
    }

    fn repair_session<'a>(&'a self, recipient: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let link = self.link()?;
            let _slot = self.send_slot.lock().await;
            let to = address(recipient, servers::LEGACY_USER);
            link.repair_session(&to).await
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
            let Some(mut live) = live else {
                return Ok(());
            };

            if tokio::time::timeout(CLOSE_GRACE, live.link.call("close", Value::Null))
                .await
                .is_err()
            {
                debug!("bridge did not acknowledge close");
            }
            live.link.fail_pending("transport destroyed");
            live.reader.abort();
            live.writer.abort();

            if let Err(err) = live.child.kill().await {
                debug!("bridge already gone: {err}");
            }
            info!("bridge transport destroyed");
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "bridge"
    }
}
