//! Connection handler for a single subscriber stream.
//!
//! Each subscribe request gets its own `ConnectionHandler`, driven through
//! an explicit state machine as the response body pulls messages from it:
//!
//! ```text
//! Connecting ──▶ Replaying ──▶ Streaming ──▶ Closing ──▶ Closed
//!                    │              │                       ▲
//!                    └──────────────┴── transport dropped ──┘
//! ```
//!
//! - `Connecting`: subscribes (history snapshot + registration in one step)
//! - `Replaying`: yields the snapshot
//! - `Streaming`: yields queued live messages until the subscriber is
//!   flagged or the server shuts down
//! - `Closing`: on shutdown yields what is still queued, then unregisters
//!
//! The HTTP layer drops the stream when the peer hangs up or a write fails
//! or times out; dropping the handler closes it with
//! [`CloseReason::Disconnected`].
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors end this connection only

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use ssecast_core::{Message, MessageId};

use crate::broadcaster::{BroadcastError, Broadcaster, Subscription};
use crate::registry::SubscriberId;

/// Lifecycle of a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Replaying,
    Streaming,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Replaying => "replaying",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a connection left `Streaming` (or never reached it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Transport went away: the peer hung up, or a write failed or timed out
    Disconnected,
    /// Registry dropped the subscriber (queue full or closed)
    Evicted,
    /// Server shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Evicted => write!(f, "evicted"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Outcome of a connection so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub subscriber_id: SubscriberId,
    /// Messages handed to the transport, replay included
    pub delivered: u64,
    pub reason: Option<CloseReason>,
}

/// Connection handler for one subscriber.
pub struct ConnectionHandler {
    broadcaster: Arc<Broadcaster>,
    subscriber_id: SubscriberId,
    peer: Option<SocketAddr>,
    replay: VecDeque<Message>,
    receiver: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    state: ConnectionState,
    delivered: u64,
    reason: Option<CloseReason>,
    /// Registry entry already removed
    unregistered: bool,
}

impl ConnectionHandler {
    /// Subscribes, replaying only messages with an id greater than
    /// `resume_after` when it is set.
    pub async fn connect(
        broadcaster: Arc<Broadcaster>,
        resume_after: Option<MessageId>,
        peer: Option<SocketAddr>,
    ) -> Result<Self, BroadcastError> {
        let Subscription {
            id,
            replay,
            receiver,
            cancel,
        } = broadcaster.subscribe(resume_after, peer).await?;

        let mut handler = Self {
            broadcaster,
            subscriber_id: id,
            peer,
            replay: replay.into(),
            receiver,
            cancel,
            state: ConnectionState::Connecting,
            delivered: 0,
            reason: None,
            unregistered: false,
        };
        handler.transition(ConnectionState::Replaying);
        Ok(handler)
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            subscriber_id: self.subscriber_id,
            delivered: self.delivered,
            reason: self.reason,
        }
    }

    /// Advances the state machine to the next message to send.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.state {
                ConnectionState::Connecting => self.transition(ConnectionState::Replaying),

                ConnectionState::Replaying => match self.replay.pop_front() {
                    Some(message) => return Some(self.deliver(message)),
                    None => {
                        trace!(subscriber_id = %self.subscriber_id, "Replay complete");
                        self.transition(ConnectionState::Streaming);
                    }
                },

                ConnectionState::Streaming => {
                    let next = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => None,
                        message = self.receiver.recv() => message,
                    };

                    match next {
                        Some(message) => return Some(self.deliver(message)),
                        None => {
                            let reason = if self.broadcaster.is_closed().await {
                                CloseReason::Shutdown
                            } else {
                                CloseReason::Evicted
                            };
                            self.reason = Some(reason);
                            self.transition(ConnectionState::Closing);
                        }
                    }
                }

                ConnectionState::Closing => {
                    // Shutdown leaves the farewell at the end of the queue
                    if self.reason == Some(CloseReason::Shutdown) {
                        if let Ok(message) = self.receiver.try_recv() {
                            return Some(self.deliver(message));
                        }
                    }

                    self.broadcaster.unsubscribe(self.subscriber_id).await;
                    self.unregistered = true;
                    self.finish();
                }

                ConnectionState::Closed => return None,
            }
        }
    }

    /// The messages this connection sends, in order, ending when it closes.
    pub fn into_stream(mut self) -> impl Stream<Item = Message> + Send + 'static {
        async_stream::stream! {
            while let Some(message) = self.next_message().await {
                yield message;
            }
        }
    }

    fn deliver(&mut self, message: Message) -> Message {
        self.delivered += 1;
        message
    }

    /// Closing → Closed.
    fn finish(&mut self) {
        let reason = *self.reason.get_or_insert(CloseReason::Disconnected);

        if !self.unregistered {
            self.unregistered = true;
            let broadcaster = Arc::clone(&self.broadcaster);
            let id = self.subscriber_id;
            // Without a runtime the registry drops the entry on its next send
            if let Ok(runtime) = Handle::try_current() {
                runtime.spawn(async move {
                    broadcaster.unsubscribe(id).await;
                });
            }
        }

        self.transition(ConnectionState::Closed);
        info!(
            subscriber_id = %self.subscriber_id,
            peer = ?self.peer,
            delivered = self.delivered,
            reason = %reason,
            "Subscriber disconnected"
        );
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(
            subscriber_id = %self.subscriber_id,
            from = %self.state,
            to = %next,
            "Connection state change"
        );
        self.state = next;
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.transition(ConnectionState::Closing);
            self.finish();
        }
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("subscriber_id", &self.subscriber_id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    // Tests CAN use `.unwrap()` - panics are acceptable in tests

    async fn next_data(handler: &mut ConnectionHandler) -> String {
        let message = tokio::time::timeout(Duration::from_secs(5), handler.next_message())
            .await
            .unwrap()
            .unwrap();
        message.payload_lossy().into_owned()
    }

    async fn wait_for_subscribers(broadcaster: &Broadcaster, count: usize) {
        for _ in 0..100 {
            if broadcaster.registry().len().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} subscribers");
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let broadcaster = Arc::new(Broadcaster::new(3, 16));
        for payload in ["a", "b", "c", "d"] {
            broadcaster.publish(payload).await.unwrap();
        }

        let mut handler = ConnectionHandler::connect(Arc::clone(&broadcaster), None, None)
            .await
            .unwrap();
        assert_eq!(handler.state(), ConnectionState::Replaying);
        assert_eq!(next_data(&mut handler).await, "b");
        assert_eq!(next_data(&mut handler).await, "c");
        assert_eq!(next_data(&mut handler).await, "d");

        broadcaster.publish("e").await.unwrap();
        let message = handler.next_message().await.unwrap();
        assert_eq!(message.id(), MessageId::new(5));
        assert_eq!(handler.state(), ConnectionState::Streaming);
        assert_eq!(handler.summary().delivered, 4);
    }

    #[tokio::test]
    async fn test_resume_skips_seen_messages() {
        let broadcaster = Arc::new(Broadcaster::new(10, 16));
        for payload in ["a", "b", "c"] {
            broadcaster.publish(payload).await.unwrap();
        }

        let mut handler =
            ConnectionHandler::connect(Arc::clone(&broadcaster), Some(MessageId::new(2)), None)
                .await
                .unwrap();
        assert_eq!(next_data(&mut handler).await, "c");
    }

    #[tokio::test]
    async fn test_dropped_transport_unregisters() {
        let broadcaster = Arc::new(Broadcaster::new(10, 16));
        let stream = ConnectionHandler::connect(Arc::clone(&broadcaster), None, None)
            .await
            .unwrap()
            .into_stream();
        assert_eq!(broadcaster.registry().len().await, 1);

        drop(stream);

        wait_for_subscribers(&broadcaster, 0).await;
        let message = broadcaster.publish("after").await.unwrap();
        assert_eq!(message.payload_lossy(), "after");
    }

    #[tokio::test]
    async fn test_shutdown_drains_farewell() {
        let broadcaster = Arc::new(Broadcaster::new(10, 16));
        let mut handler = ConnectionHandler::connect(Arc::clone(&broadcaster), None, None)
            .await
            .unwrap();

        broadcaster.publish("last").await.unwrap();
        broadcaster.close(Some("bye")).await;

        assert_eq!(next_data(&mut handler).await, "last");
        assert_eq!(next_data(&mut handler).await, "bye");
        assert!(handler.next_message().await.is_none());

        assert_eq!(handler.state(), ConnectionState::Closed);
        let summary = handler.summary();
        assert_eq!(summary.reason, Some(CloseReason::Shutdown));
        assert_eq!(summary.delivered, 2);
    }

    #[tokio::test]
    async fn test_stream_ends_after_shutdown() {
        let broadcaster = Arc::new(Broadcaster::new(10, 16));
        broadcaster.publish("replayed").await.unwrap();
        let stream = ConnectionHandler::connect(Arc::clone(&broadcaster), None, None)
            .await
            .unwrap()
            .into_stream();

        broadcaster.close(Some("bye")).await;

        let payloads: Vec<String> = stream
            .map(|message| message.payload_lossy().into_owned())
            .collect()
            .await;
        assert_eq!(payloads, vec!["replayed", "bye"]);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_is_rejected() {
        let broadcaster = Arc::new(Broadcaster::new(10, 16));
        broadcaster.close(None).await;

        let result = ConnectionHandler::connect(Arc::clone(&broadcaster), None, None).await;
        assert!(matches!(result, Err(BroadcastError::Closed)));
        assert!(broadcaster.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_evicted() {
        let broadcaster = Arc::new(Broadcaster::new(10, 1));
        let mut handler = ConnectionHandler::connect(Arc::clone(&broadcaster), None, None)
            .await
            .unwrap();

        // Nothing is pulled while these are published
        for i in 0..10 {
            broadcaster.publish(format!("m{i}")).await.unwrap();
        }
        assert!(broadcaster.registry().is_empty().await);

        assert!(handler.next_message().await.is_none());
        let summary = handler.summary();
        assert_eq!(summary.reason, Some(CloseReason::Evicted));
        assert_eq!(summary.delivered, 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Streaming.to_string(), "streaming");
        assert_eq!(CloseReason::Evicted.to_string(), "evicted");
        assert_eq!(CloseReason::Disconnected.to_string(), "disconnected");
    }
}
