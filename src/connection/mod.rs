//! Connection lifecycle: the state machine owning the transport, plus the
//! timers it drives (reconnection backoff, health probe, session backup).

mod backup;
mod health;
mod manager;
pub mod qr;
pub mod reconnect;

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::transport::TransportError;

pub use manager::ConnectionManager;
pub use qr::{QrError, QrLifecycle};
pub use reconnect::{Backoff, BackoffPolicy, ReconnectScheduler};

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// A newer attempt or a teardown replaced this one.
    #[error("connection attempt superseded")]
    Superseded,
}

/// Handle of one background task, aborted when replaced or cleared.
#[derive(Default)]
pub(crate) struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    pub(crate) fn replace(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn abort(&self) {
        if let Some(handle) = self.lock().take() {
            handle.abort();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
