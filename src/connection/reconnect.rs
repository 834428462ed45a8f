//! Bounded exponential backoff for reconnection attempts.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::BackoffConfig;

/// What to do after the n-th consecutive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Try again after the delay.
    Retry(Duration),
    /// Too many failures: pause, then start counting from zero.
    Cooldown(Duration),
}

/// Pure delay computation, see [`BackoffConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// `min(base * factor^(attempt-1), cap)`; attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.config.factor.max(1).saturating_pow(exponent);
        self.config
            .base
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
            .min(self.config.cap)
    }

    pub fn next(&self, attempt: u32) -> Backoff {
        if attempt >= self.config.max_attempts {
            Backoff::Cooldown(self.config.cooldown)
        } else {
            Backoff::Retry(self.delay(attempt))
        }
    }
}

type Slot = Arc<Mutex<Option<(u64, JoinHandle<()>)>>>;

/// Holds at most one pending reconnection timer.
///
/// A fired timer removes itself from the slot before running its action, so
/// [`cancel`](Self::cancel) never interrupts an attempt already under way.
#[derive(Default)]
pub struct ReconnectScheduler {
    slot: Slot,
    next_id: AtomicU64,
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`, replacing any pending timer.
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = self.slot.clone();

        let mut pending = lock(&self.slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = lock(&slot);
                if pending.as_ref().is_some_and(|(current, _)| *current == id) {
                    pending.take();
                }
            }
            action.await;
        });
        if let Some((_, previous)) = pending.replace((id, handle)) {
            previous.abort();
        }
    }

    /// Drop the pending timer, if any.
    pub fn cancel(&self) -> bool {
        match lock(&self.slot).take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, Option<(u64, JoinHandle<()>)>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
