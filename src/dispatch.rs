//! Outbound message delivery.
//!
//! A send walks the recipient's candidates in order and stops at the first
//! success. Transport errors arrive already classified; the dispatcher only
//! decides what each class means for the current candidate:
//!
//! - post-send failures (read receipts, chat bookkeeping) count as delivered
//! - a missing session key gets one repair and exactly one retry
//! - rate limits are retried with backoff, then the candidate cools down
//! - anything else moves on to the next candidate
//!
//! Every transport call is preceded by a readiness check, so nothing is sent
//! unless the connection is `READY`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::ConnectorConfig;
use crate::connection::{BackoffPolicy, ConnectionManager};
use crate::expiring::ExpiringMap;
use crate::phone::{PhoneCandidate, PhoneError, PhoneNumberResolver, Reconciliation};
use crate::transport::{Transport, TransportError};
use crate::types::{ConnectionStatus, ConnectorEvent, MessageStatus, OutboundMessage};

/// Successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Network message id, or the local id when the transport gave none.
    pub message_id: String,
    /// Candidate that accepted the message.
    pub recipient: String,
    /// Transport send calls issued.
    pub attempts: u32,
    /// Post-send error that was tolerated, if any.
    pub benign_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("connection is not ready (status {status})")]
    NotReady { status: ConnectionStatus },
    #[error("invalid recipient: {0}")]
    InvalidRecipient(#[from] PhoneError),
    #[error("sending to {recipient} is rate limited")]
    RateLimited {
        recipient: String,
        retry_after: Option<Duration>,
    },
    #[error("delivery to {recipient} failed after {attempts} attempts: {last_error}")]
    DeliveryFailed {
        recipient: String,
        attempts: u32,
        last_error: TransportError,
    },
}

/// Result of working one candidate.
enum Outcome {
    Sent {
        id: String,
        benign_error: Option<String>,
    },
    Failed(TransportError),
}

/// Delivers messages through the connection's live transport.
pub struct MessageDispatcher {
    connection: ConnectionManager,
    resolver: PhoneNumberResolver,
    backoff: BackoffPolicy,
    send_timeout: Duration,
    rate_limit_retries: u32,
    rate_limit_cooldown: Duration,
    verify_registration: bool,
    resolve_canonical_id: bool,
    cooldowns: Mutex<ExpiringMap<String, ()>>,
}

impl MessageDispatcher {
    pub fn new(connection: ConnectionManager) -> Self {
        let config: &ConnectorConfig = connection.config();
        Self {
            resolver: PhoneNumberResolver::new(config.numbering_plan.clone()),
            backoff: BackoffPolicy::new(config.backoff.clone()),
            send_timeout: config.send_timeout,
            rate_limit_retries: config.rate_limit_retries,
            rate_limit_cooldown: config.rate_limit_cooldown,
            verify_registration: config.verify_registration,
            resolve_canonical_id: config.resolve_canonical_id,
            cooldowns: Mutex::new(ExpiringMap::new()),
            connection,
        }
    }

    pub fn resolver(&self) -> &PhoneNumberResolver {
        &self.resolver
    }

    /// Deliver `body` to the subscriber behind `raw_phone`.
    pub async fn send(&self, raw_phone: &str, body: &str) -> Result<Delivered, DispatchError> {
        let mut message = OutboundMessage {
            id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            recipient_candidate: raw_phone.to_string(),
            body: body.to_string(),
            attempt_index: 0,
            status: MessageStatus::Pending,
            last_error: None,
        };

        let result = match self.accept(raw_phone) {
            Ok(mut target) => {
                message.recipient_candidate = target.normalized.clone();
                self.deliver(&mut target, &mut message).await
            }
            Err(err) => Err(err),
        };
        match &result {
            Ok(delivered) => {
                info!(
                    "message {} delivered to {} after {} attempt(s)",
                    message.id, delivered.recipient, delivered.attempts
                );
                message.status = MessageStatus::Sent;
                self.publish(ConnectorEvent::MessageSent(message));
            }
            Err(err) => {
                warn!("message {} not delivered: {err}", message.id);
                message.status = MessageStatus::Failed;
                message.last_error = Some(err.to_string());
                self.publish(ConnectorEvent::MessageFailed(message));
            }
        }
        result
    }

    async fn deliver(
        &self,
        target: &mut PhoneCandidate,
        message: &mut OutboundMessage,
    ) -> Result<Delivered, DispatchError> {
        let mut registered = HashMap::new();
        if self.resolve_canonical_id {
            self.resolve_canonical(target, &mut registered).await?;
        }

        let mut last_error = None;
        for candidate in target.candidates.clone() {
            message.recipient_candidate = candidate.clone();

            if let Some(retry_after) = self.cooldown_remaining(&candidate) {
                return Err(DispatchError::RateLimited {
                    recipient: candidate,
                    retry_after: Some(retry_after),
                });
            }

            if self.verify_registration && !self.is_registered(&candidate, &mut registered).await? {
                debug!("{candidate} is not registered, skipping");
                last_error = Some(TransportError::UnregisteredRecipient(candidate));
                continue;
            }

            match self.attempt(&candidate, message).await? {
                Outcome::Sent { id, benign_error } => {
                    return Ok(Delivered {
                        message_id: id,
                        recipient: candidate,
                        attempts: message.attempt_index,
                        benign_error,
                    });
                }
                Outcome::Failed(TransportError::RateLimited { retry_after }) => {
                    self.start_cooldown(&candidate);
                    return Err(DispatchError::RateLimited {
                        recipient: candidate,
                        retry_after,
                    });
                }
                Outcome::Failed(err) => {
                    debug!("candidate {candidate} failed: {err}");
                    message.last_error = Some(err.to_string());
                    last_error = Some(err);
                }
            }
        }

        Err(DispatchError::DeliveryFailed {
            recipient: target.normalized.clone(),
            attempts: message.attempt_index,
            last_error: last_error
                .unwrap_or_else(|| TransportError::Unknown("no candidates".into())),
        })
    }

    /// Ask the network which id the canonical number is registered as, and
    /// put a provably equivalent legacy id first.
    async fn resolve_canonical(
        &self,
        target: &mut PhoneCandidate,
        registered: &mut HashMap<String, bool>,
    ) -> Result<(), DispatchError> {
        let normalized = target.normalized.clone();
        let reported = match self.lookup(&normalized).await? {
            Ok(Some(reported)) => reported,
            Ok(None) => {
                registered.insert(normalized, false);
                return Ok(());
            }
            Err(err) => {
                debug!("canonical lookup of {normalized} failed: {err}");
                return Ok(());
            }
        };

        match self.resolver.reconcile_transport_id(&normalized, &reported) {
            Reconciliation::Identical => {
                registered.insert(normalized, true);
            }
            Reconciliation::LegacyForm(legacy) => {
                info!("{normalized} is registered under its legacy form {legacy}");
                registered.insert(legacy.clone(), true);
                target.promote(&legacy);
            }
            Reconciliation::Rejected => {
                warn!("ignoring id {reported} reported for {normalized}: not the same subscriber");
            }
        }
        Ok(())
    }

    /// Best effort: an unanswered lookup counts as registered.
    async fn is_registered(
        &self,
        candidate: &str,
        known: &mut HashMap<String, bool>,
    ) -> Result<bool, DispatchError> {
        if let Some(registered) = known.get(candidate) {
            return Ok(*registered);
        }
        let registered = match self.lookup(candidate).await? {
            Ok(found) => found.is_some(),
            Err(err) => {
                debug!("registration check of {candidate} failed: {err}");
                true
            }
        };
        known.insert(candidate.to_string(), registered);
        Ok(registered)
    }

    async fn attempt(
        &self,
        candidate: &str,
        message: &mut OutboundMessage,
    ) -> Result<Outcome, DispatchError> {
        let mut repaired = false;
        let mut rate_limited = 0;

        loop {
            let transport = self.transport()?;
            message.attempt_index += 1;
            let result = self
                .bounded(transport.send_message(candidate, &message.body))
                .await;

            match result {
                Ok(id) => {
                    return Ok(Outcome::Sent {
                        id,
                        benign_error: None,
                    })
                }
                Err(TransportError::PostSendAck(detail)) => {
                    info!("ignoring post-send failure for {candidate}: {detail}");
                    return Ok(Outcome::Sent {
                        id: message.id.clone(),
                        benign_error: Some(detail),
                    });
                }
                Err(TransportError::SessionKeyMissing(detail)) if !repaired => {
                    warn!("no session with {candidate} ({detail}), repairing");
                    repaired = true;
                    let transport = self.transport()?;
                    if let Err(err) = self.bounded(transport.repair_session(candidate)).await {
                        warn!("session repair with {candidate} failed: {err}");
                    }
                }
                Err(TransportError::RateLimited { retry_after })
                    if rate_limited < self.rate_limit_retries =>
                {
                    rate_limited += 1;
                    let delay = retry_after.unwrap_or_else(|| self.backoff.delay(rate_limited));
                    warn!("rate limited sending to {candidate}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Ok(Outcome::Failed(err)),
            }
        }
    }

    /// Lookup through the live transport. The outer error is readiness only.
    async fn lookup(
        &self,
        phone: &str,
    ) -> Result<Result<Option<String>, TransportError>, DispatchError> {
        let transport = self.transport()?;
        Ok(self.bounded(transport.lookup(phone)).await)
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        tokio::time::timeout(self.send_timeout, call)
            .await
            .unwrap_or(Err(TransportError::Timeout(self.send_timeout)))
    }

    /// Reject up front when not `READY` or when the number is unusable.
    fn accept(&self, raw_phone: &str) -> Result<PhoneCandidate, DispatchError> {
        self.transport()?;
        Ok(self.resolver.build_candidates(raw_phone)?)
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, DispatchError> {
        self.connection
            .ready_transport()
            .map_err(|status| DispatchError::NotReady { status })
    }

    fn cooldown_remaining(&self, candidate: &str) -> Option<Duration> {
        self.cooldowns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remaining(&candidate.to_string())
    }

    fn start_cooldown(&self, candidate: &str) {
        warn!(
            "{candidate} still rate limited, cooling down for {:?}",
            self.rate_limit_cooldown
        );
        self.cooldowns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(candidate.to_string(), (), self.rate_limit_cooldown);
    }

    fn publish(&self, event: ConnectorEvent) {
        self.connection.events().publish(event);
    }
}
