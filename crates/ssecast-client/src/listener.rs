//! Stream listener for the ssecast CLI.
//!
//! This module provides the `StreamListener` which handles:
//! - Subscribing to the server's event stream
//! - Automatic reconnection with exponential backoff
//! - Resuming with `Last-Event-ID` so no retained message is missed
//! - Forwarding decoded events to the caller over a channel
//!
//! The response body is fed through the shared SSE decoder, so events split
//! across network reads arrive whole.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Url};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ssecast_protocol::{decode_stream, ProtocolError, SseEvent};

use crate::error::{ClientError, Result};

/// Events decoded from one open subscription.
pub type EventStream = BoxStream<'static, std::result::Result<SseEvent, ProtocolError>>;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the stream listener.
///
/// # Example
///
/// ```rust
/// use ssecast_client::ListenerConfig;
/// use std::time::Duration;
///
/// let config = ListenerConfig {
///     retry_initial_delay: Duration::from_millis(500),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Initial delay before the first retry after a failed connection.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,

    /// Limit for connecting and receiving the response headers.
    pub connect_timeout: Duration,

    /// Reconnect after the stream ends or a connection attempt fails.
    pub reconnect: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
            connect_timeout: Duration::from_secs(10),
            reconnect: true,
        }
    }
}

/// Delay before the retry after one that waited `delay`.
pub fn next_delay(delay: Duration, config: &ListenerConfig) -> Duration {
    let next_ms = (delay.as_millis() as f64 * config.retry_multiplier) as u64;
    Duration::from_millis(next_ms).min(config.retry_max_delay)
}

// ============================================================================
// Events
// ============================================================================

/// What the listener reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// A stream was opened; `resumed_after` is the `Last-Event-ID` sent.
    Connected { resumed_after: Option<String> },

    /// One event from the stream, in server order.
    Event(SseEvent),

    /// The stream ended; the listener may reconnect.
    Disconnected { reason: String },
}

// ============================================================================
// Stream Listener
// ============================================================================

/// Subscribes to a broadcast server and forwards its events.
///
/// # Connection Lifecycle
///
/// 1. Connects and sends `GET <path>` with `Last-Event-ID` once an event has
///    been seen
/// 2. Forwards every event to the channel, remembering its id
/// 3. On disconnect, reports it and retries with exponential backoff
///
/// Requests the server rejects with a 4xx status are not retried.
///
/// # Example
///
/// ```rust,ignore
/// use ssecast_client::{StreamListener, ListenerConfig};
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// let listener = StreamListener::new(url, ListenerConfig::default(), tx, CancellationToken::new());
/// tokio::spawn(listener.run());
/// while let Some(event) = rx.recv().await { /* ... */ }
/// ```
pub struct StreamListener {
    url: Url,
    client: Client,
    config: ListenerConfig,

    /// Channel to send events to the owner.
    event_tx: mpsc::UnboundedSender<ListenerEvent>,

    /// Cancellation token for graceful shutdown.
    cancel_token: CancellationToken,

    /// Id of the last event received, sent as `Last-Event-ID` on reconnect.
    last_event_id: Option<String>,

    /// Reconnection delay requested by the server with `retry:`.
    server_retry: Option<Duration>,
}

impl StreamListener {
    #[must_use]
    pub fn new(
        url: Url,
        config: ListenerConfig,
        event_tx: mpsc::UnboundedSender<ListenerEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            url,
            client: Client::new(),
            config,
            event_tx,
            cancel_token,
            last_event_id: None,
            server_retry: None,
        }
    }

    /// Starts with `Last-Event-ID: id`, replaying only later messages.
    #[must_use]
    pub fn resume_after(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = Some(id.into());
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Main loop. Returns when cancelled, when the event receiver is
    /// dropped, or on a failure that retrying cannot fix.
    ///
    /// With `reconnect` disabled it returns after the first stream ends.
    pub async fn run(mut self) -> Result<()> {
        info!(url = %self.url, "Stream listener starting");

        loop {
            if self.cancel_token.is_cancelled() || self.event_tx.is_closed() {
                info!("Stream listener shutting down");
                return Ok(());
            }

            let stream = match self.connect_with_retry().await {
                Ok(stream) => stream,
                Err(ClientError::Cancelled) => {
                    info!("Stream listener shutting down (cancelled)");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            info!(resumed_after = ?self.last_event_id, "Subscribed");
            let _ = self.event_tx.send(ListenerEvent::Connected {
                resumed_after: self.last_event_id.clone(),
            });

            let result = self.handle_stream(stream).await;
            let reason = match &result {
                Ok(()) => "stream ended".to_string(),
                Err(e) => e.to_string(),
            };
            if !self.cancel_token.is_cancelled() {
                warn!(reason = %reason, "Stream disconnected");
            }
            // Owner may be shutting down
            let _ = self.event_tx.send(ListenerEvent::Disconnected { reason });

            if !self.config.reconnect {
                return result;
            }
        }
    }

    /// Opens one stream, without retrying.
    ///
    /// Sends `Last-Event-ID` when an id is known and checks that the server
    /// answered with an event stream.
    pub async fn open(&self) -> Result<EventStream> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(id) = &self.last_event_id {
            request = request.header("Last-Event-ID", id.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .map(|body| body.trim().to_string())
                .unwrap_or_default();
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("text/event-stream") {
            return Err(ClientError::InvalidResponse(format!(
                "expected an event stream, got Content-Type {content_type:?}"
            )));
        }

        Ok(decode_stream(response.bytes_stream()).boxed())
    }

    /// Opens a stream, retrying with exponential backoff until it succeeds,
    /// the error is permanent, or the token is cancelled.
    async fn connect_with_retry(&self) -> Result<EventStream> {
        let mut delay = self.server_retry.unwrap_or(self.config.retry_initial_delay);
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            debug!(attempt, url = %self.url, "Attempting to subscribe");

            let result = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Err(ClientError::Cancelled),
                result = timeout(self.config.connect_timeout, self.open()) => result,
            };

            let error = match result {
                Ok(Ok(stream)) => {
                    debug!(attempt, "Subscription successful");
                    return Ok(stream);
                }
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => ClientError::Timeout(self.config.connect_timeout),
            };

            if !self.config.reconnect {
                return Err(error);
            }
            if attempt == 1 {
                warn!(error = %error, "Failed to subscribe, will retry");
            } else {
                debug!(attempt, error = %error, "Subscribe attempt failed");
            }

            // Wait before retry, checking for cancellation
            tokio::select! {
                _ = sleep(delay) => {
                    delay = next_delay(delay, &self.config);
                }
                _ = self.cancel_token.cancelled() => {
                    info!("Subscribe retry cancelled");
                    return Err(ClientError::Cancelled);
                }
            }
        }
    }

    /// Forwards events until the stream ends, fails, or the token fires.
    async fn handle_stream(&mut self, mut stream: EventStream) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Ok(()),
                next = stream.next() => next.transpose()?,
            };

            let Some(event) = next else {
                return Ok(());
            };

            if let Some(id) = &event.id {
                if self.last_event_id.as_ref() != Some(id) {
                    self.last_event_id = Some(id.clone());
                }
            }
            if let Some(retry) = event.retry {
                self.server_retry = Some(Duration::from_millis(retry));
            }

            debug!(id = ?event.id, bytes = event.data.len(), "Event received");
            if self.event_tx.send(ListenerEvent::Event(event)).is_err() {
                debug!("Event receiver dropped");
                return Ok(());
            }
        }
    }
}
