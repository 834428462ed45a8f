//! Periodic session backup: while `READY`, re-save the latest credentials
//! (refreshing their TTL) and the status snapshot.

use std::sync::Weak;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::manager::{lock, Inner};
use crate::types::ConnectionStatus;

pub(super) fn spawn(inner: Weak<Inner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let Some(manager) = inner.upgrade() else {
                return;
            };
            if manager.status() != ConnectionStatus::Ready {
                continue;
            }

            let credentials = lock(&manager.latest_credentials).clone();
            if let Some(credentials) = credentials {
                if let Err(err) = manager.auth.save(&credentials) {
                    warn!("[{}] credential backup failed: {err}", manager.config.session_name);
                }
            }
            manager.persist_snapshot();
            debug!("[{}] session backed up", manager.config.session_name);
        }
    })
}
