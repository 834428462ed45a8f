//! Periodic liveness probe, running only while `READY`.

use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::manager::Inner;
use crate::transport::{LinkHealth, TransportError};
use crate::types::{ConnectionStatus, DisconnectReason};

/// Probe the transport of `generation` every `interval`. A failed, degraded
/// or timed out probe is reported as link loss and ends the monitor; a
/// logged out session goes to `AUTH_FAILURE` instead.
pub(super) fn spawn(
    inner: Weak<Inner>,
    generation: u64,
    interval: Duration,
    probe_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(manager) = inner.upgrade() else {
                return;
            };
            if manager.connecting.load(Ordering::SeqCst) {
                debug!("skipping health check while connecting");
                continue;
            }
            if manager.status() != ConnectionStatus::Ready {
                return;
            }
            let Some(transport) = manager.current_transport() else {
                return;
            };

            let failure = match tokio::time::timeout(probe_timeout, transport.probe()).await {
                Ok(Ok(LinkHealth::Connected)) => None,
                Ok(Ok(LinkHealth::Degraded(state))) => Some(format!("link degraded: {state}")),
                Ok(Err(TransportError::LoggedOut(detail))) => {
                    warn!("[{}] session logged out: {detail}", manager.config.session_name);
                    tokio::spawn(async move { manager.logged_out(generation).await });
                    return;
                }
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(format!("probe timed out after {probe_timeout:?}")),
            };
            let Some(failure) = failure else {
                debug!("[{}] health check ok", manager.config.session_name);
                continue;
            };

            warn!("[{}] health check failed: {failure}", manager.config.session_name);
            // link_lost aborts this task, so it runs on its own
            tokio::spawn(async move {
                manager
                    .link_lost(generation, DisconnectReason::HealthCheckFailed(failure))
                    .await;
            });
            return;
        }
    })
}
