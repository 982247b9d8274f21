//! Bounded replay history.
//!
//! Holds the last `capacity` published messages in publish order. The
//! history is the only place message ids are assigned: [`MessageHistory::append`]
//! stamps the next id under the write lock, so ids are strictly increasing
//! and never reused.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - No direct indexing into the buffer

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::trace;

use ssecast_core::{Message, MessageId};

/// Default number of messages kept for replay.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Fixed-capacity FIFO of published messages.
#[derive(Debug)]
pub struct MessageHistory {
    inner: RwLock<HistoryBuffer>,
    capacity: usize,
}

#[derive(Debug)]
struct HistoryBuffer {
    messages: VecDeque<Message>,
    next_id: MessageId,
    last_id: Option<MessageId>,
}

impl MessageHistory {
    /// Creates an empty history. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(HistoryBuffer {
                messages: VecDeque::with_capacity(capacity),
                next_id: MessageId::FIRST,
                last_id: None,
            }),
            capacity,
        }
    }

    /// Stores a payload as the next message, evicting the oldest entry when
    /// the buffer is full.
    pub async fn append(&self, payload: impl Into<Bytes>) -> Message {
        let mut buffer = self.inner.write().await;

        let id = buffer.next_id;
        let message = Message::new(id, payload);
        buffer.next_id = id.next();
        buffer.last_id = Some(id);

        if buffer.messages.len() >= self.capacity {
            if let Some(evicted) = buffer.messages.pop_front() {
                trace!(message_id = %evicted.id(), "Evicted message from history");
            }
        }
        buffer.messages.push_back(message.clone());

        message
    }

    /// Point-in-time copy of the history, oldest first.
    pub async fn snapshot(&self) -> Vec<Message> {
        self.inner.read().await.messages.iter().cloned().collect()
    }

    /// Like [`snapshot`](Self::snapshot), restricted to ids greater than `after`.
    pub async fn snapshot_after(&self, after: MessageId) -> Vec<Message> {
        self.inner
            .read()
            .await
            .messages
            .iter()
            .filter(|message| message.id() > after)
            .cloned()
            .collect()
    }

    /// Id of the most recently appended message, even if already evicted.
    pub async fn last_id(&self) -> Option<MessageId> {
        self.inner.read().await.last_id
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
