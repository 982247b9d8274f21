//! Registry of live subscriber connections.
//!
//! Every subscriber owns a bounded delivery queue. Broadcasting only ever
//! enqueues (`try_send`); the connection task does the transport write. A
//! subscriber whose queue is full or closed is flagged: its cancellation token
//! fires and it is removed once the broadcast has finished iterating.
//!
//! # Architecture
//!
//! ```text
//!                   broadcast(message)
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────┐
//! │ ClientRegistry                               │
//! │  RwLock<HashMap<SubscriberId, Subscriber>>   │
//! └──────┬───────────────┬───────────────┬───────┘
//!        │ try_send      │ try_send      │ try_send
//!        ▼               ▼               ▼
//!   [queue sub-1]   [queue sub-2]   [queue sub-3] (full → flagged)
//!        │               │
//!        ▼               ▼
//!  ConnectionHandler ConnectionHandler
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are classified into [`DeliveryOutcome`]s, never propagated

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ssecast_core::Message;

mod subscriber;

pub use subscriber::{
    BroadcastReport, DeliveryOutcome, Registration, SubscriberId, SubscriberInfo,
};

use subscriber::Subscriber;

/// Default per-subscriber delivery queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Set of live subscribers keyed by [`SubscriberId`].
#[derive(Debug)]
pub struct ClientRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,

    /// Parent of every subscriber's token, fired by [`close_all`](Self::close_all)
    closed: CancellationToken,
}

impl ClientRegistry {
    /// Creates an empty registry. A queue capacity of zero is treated as one.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            closed: CancellationToken::new(),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Adds a subscriber and hands back its queue and cancellation token.
    pub async fn register(&self, peer: Option<SocketAddr>) -> Registration {
        let id = SubscriberId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let cancel = self.closed.child_token();

        let subscriber = Subscriber {
            sender,
            cancel: cancel.clone(),
            registered_at: Utc::now(),
            peer,
        };

        let total = {
            let mut subs = self.subscribers.write().await;
            subs.insert(id, subscriber);
            subs.len()
        };

        debug!(subscriber_id = %id, peer = ?peer, total, "Registered subscriber");

        Registration {
            id,
            receiver,
            cancel,
        }
    }

    /// Removes a subscriber. Returns `false` if it was already gone.
    pub async fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().await.remove(&id);

        match removed {
            Some(subscriber) => {
                subscriber.cancel.cancel();
                debug!(subscriber_id = %id, "Unregistered subscriber");
                true
            }
            None => false,
        }
    }

    /// Enqueues `message` for every subscriber registered when the call starts.
    ///
    /// Never waits on a subscriber. Lagged and disconnected subscribers are
    /// cancelled and removed after the iteration completes.
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        {
            let subs = self.subscribers.read().await;
            for (id, subscriber) in subs.iter() {
                let outcome = match subscriber.sender.try_send(message.clone()) {
                    Ok(()) => DeliveryOutcome::Delivered,
                    Err(TrySendError::Full(_)) => DeliveryOutcome::Lagged,
                    Err(TrySendError::Closed(_)) => DeliveryOutcome::Disconnected,
                };
                report.record(*id, outcome);
            }
        }

        // Read lock released above; flagged subscribers are removed now
        {
            let mut failed = report.failed().peekable();
            if failed.peek().is_some() {
                let mut subs = self.subscribers.write().await;
                for (id, outcome) in failed {
                    if let Some(subscriber) = subs.remove(&id) {
                        subscriber.cancel.cancel();
                        warn!(
                            subscriber_id = %id,
                            peer = ?subscriber.peer,
                            outcome = %outcome,
                            message_id = %message.id(),
                            "Removed subscriber that could not take a message"
                        );
                    }
                }
            }
        }

        report
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().await.contains_key(&id)
    }

    /// Snapshot of every live subscriber, ordered by id.
    pub async fn subscribers(&self) -> Vec<SubscriberInfo> {
        let subs = self.subscribers.read().await;
        let mut infos: Vec<SubscriberInfo> =
            subs.iter().map(|(id, sub)| sub.info(*id)).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Cancels every subscriber and empties the registry.
    ///
    /// Subscribers registered afterwards start out cancelled.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(SubscriberId, Subscriber)> =
            self.subscribers.write().await.drain().collect();
        self.closed.cancel();

        let count = drained.len();
        debug!(count, "Closed all subscribers");
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
