//! Subscriber identity and delivery bookkeeping.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ssecast_core::Message;

// ============================================================================
// Identity
// ============================================================================

/// Opaque handle for a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ============================================================================
// Registry Entries
// ============================================================================

/// A live subscriber as held by the registry.
///
/// The sender is the only way messages reach the connection; the token is
/// how the registry tells the connection to stop.
#[derive(Debug)]
pub(crate) struct Subscriber {
    pub(crate) sender: mpsc::Sender<Message>,
    pub(crate) cancel: CancellationToken,
    pub(crate) registered_at: DateTime<Utc>,
    pub(crate) peer: Option<SocketAddr>,
}

impl Subscriber {
    pub(crate) fn info(&self, id: SubscriberId) -> SubscriberInfo {
        let queued = self
            .sender
            .max_capacity()
            .saturating_sub(self.sender.capacity());
        SubscriberInfo {
            id,
            peer: self.peer,
            registered_at: self.registered_at,
            queued,
        }
    }
}

/// What a connection gets back from [`ClientRegistry::register`](super::ClientRegistry::register).
#[derive(Debug)]
pub struct Registration {
    pub id: SubscriberId,
    /// Messages fanned out to this subscriber, in publish order
    pub receiver: mpsc::Receiver<Message>,
    /// Fires when the subscriber has been flagged or the registry is closed
    pub cancel: CancellationToken,
}

/// Read-only view of a registered subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub peer: Option<SocketAddr>,
    pub registered_at: DateTime<Utc>,
    /// Messages enqueued but not yet taken by the connection
    pub queued: usize,
}

// ============================================================================
// Broadcast Outcomes
// ============================================================================

/// Result of enqueueing one message for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Enqueued for the connection to write
    Delivered,
    /// Queue full; the subscriber cannot keep up
    Lagged,
    /// Connection already dropped its receiver
    Disconnected,
}

impl DeliveryOutcome {
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Lagged => write!(f, "lagged"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Per-subscriber outcomes of a single broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    outcomes: Vec<(SubscriberId, DeliveryOutcome)>,
}

impl BroadcastReport {
    pub(crate) fn record(&mut self, id: SubscriberId, outcome: DeliveryOutcome) {
        self.outcomes.push((id, outcome));
    }

    /// Every subscriber present when the broadcast started, with its outcome.
    pub fn outcomes(&self) -> &[(SubscriberId, DeliveryOutcome)] {
        &self.outcomes
    }

    pub fn outcome(&self, id: SubscriberId) -> Option<DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|(sub, _)| *sub == id)
            .map(|(_, outcome)| *outcome)
    }

    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_delivered())
            .count()
    }

    /// Subscribers flagged for removal by this broadcast.
    pub fn failed(&self) -> impl Iterator<Item = (SubscriberId, DeliveryOutcome)> + '_ {
        self.outcomes
            .iter()
            .copied()
            .filter(|(_, outcome)| !outcome.is_delivered())
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}
