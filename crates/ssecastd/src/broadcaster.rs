//! Single entry point for every message that enters the system.
//!
//! External publishes and heartbeat ticks both go through
//! [`Broadcaster::publish`]. A publish appends to the history and fans out to
//! the registry under one lock, so each subscriber queue sees messages in id
//! order. Fan-out only enqueues; no transport write happens under the lock.
//!
//! [`Broadcaster::subscribe`] takes the same lock to snapshot history and
//! register the new subscriber in one step. Replay therefore ends exactly
//! where the live queue begins.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - The only publish failure is [`BroadcastError::Closed`]

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use ssecast_core::{Message, MessageId};

use crate::audit::AuditLog;
use crate::history::MessageHistory;
use crate::registry::{BroadcastReport, ClientRegistry, SubscriberId};

/// State guarded by the publish lock.
#[derive(Debug, Default)]
struct PublishState {
    closed: bool,
    audit: Option<AuditLog>,
}

/// Owns the history and registry and serializes all publishes.
#[derive(Debug)]
pub struct Broadcaster {
    history: MessageHistory,
    registry: ClientRegistry,
    state: Mutex<PublishState>,
}

/// A new subscriber's starting point.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    /// Messages to write before anything from `receiver`
    pub replay: Vec<Message>,
    pub receiver: mpsc::Receiver<Message>,
    pub cancel: CancellationToken,
}

impl Broadcaster {
    pub fn new(history_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            history: MessageHistory::new(history_capacity),
            registry: ClientRegistry::new(queue_capacity),
            state: Mutex::new(PublishState::default()),
        }
    }

    /// Forwards every published message to `audit`.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.state.get_mut().audit = Some(audit);
        self
    }

    /// Stores `payload` as the next message and enqueues it for every
    /// current subscriber.
    ///
    /// Subscribers that cannot take the message are dropped from the
    /// registry; that never fails the publish.
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<Message, BroadcastError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(BroadcastError::Closed);
        }

        let (message, report) = self.append_and_fan_out(&state, payload).await;

        debug!(
            message_id = %message.id(),
            bytes = message.payload().len(),
            subscribers = report.len(),
            delivered = report.delivered(),
            "Published message"
        );

        Ok(message)
    }

    /// Snapshots history (after `after`, if given) and registers a subscriber
    /// in the same critical section as publish.
    pub async fn subscribe(
        &self,
        after: Option<MessageId>,
        peer: Option<SocketAddr>,
    ) -> Result<Subscription, BroadcastError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(BroadcastError::Closed);
        }

        let replay = match after {
            Some(id) => self.history.snapshot_after(id).await,
            None => self.history.snapshot().await,
        };
        let registration = self.registry.register(peer).await;
        drop(state);

        debug!(
            subscriber_id = %registration.id,
            replay = replay.len(),
            after = ?after.map(MessageId::get),
            "Subscribed"
        );

        Ok(Subscription {
            id: registration.id,
            replay,
            receiver: registration.receiver,
            cancel: registration.cancel,
        })
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry.unregister(id).await
    }

    /// Stops accepting publishes and subscribers, then closes every subscriber.
    ///
    /// When `farewell` is set it is published as the final message first, so
    /// it sits at the end of every subscriber's queue. Dropping the audit
    /// handle lets the audit writer finish. Returns the number of subscribers
    /// closed; a second call does nothing.
    pub async fn close(&self, farewell: Option<&str>) -> usize {
        let mut state = self.state.lock().await;
        if state.closed {
            return 0;
        }

        if let Some(text) = farewell {
            let (message, report) = self.append_and_fan_out(&state, text.to_owned()).await;
            debug!(
                message_id = %message.id(),
                delivered = report.delivered(),
                "Published farewell message"
            );
        }

        state.closed = true;
        state.audit = None;
        drop(state);

        self.registry.close_all().await
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Caller holds the publish lock.
    async fn append_and_fan_out(
        &self,
        state: &PublishState,
        payload: impl Into<Bytes>,
    ) -> (Message, BroadcastReport) {
        let message = self.history.append(payload).await;
        let report = self.registry.broadcast(&message).await;

        if let Some(audit) = &state.audit {
            audit.record(&message);
        }

        (message, report)
    }
}

/// Errors from the broadcaster.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Broadcaster is closed")]
    Closed,
}
