//! HTTP server for the broadcast daemon.
//!
//! The server:
//! - Serves the publish/subscribe route with `axum` on a [`ConnectionListener`]
//! - Tracks every open connection on a [`TaskTracker`]; subscriber
//!   connections live as long as their stream
//! - Runs the heartbeat and audit writer as supervised tasks
//! - Shuts down in order when the cancellation token fires
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ BroadcastServer │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ axum::serve
//!         ▼
//! ┌─────────────────┐  POST   ┌─────────────────┐   ┌───────────────┐
//! │     Router      │────────▶│   Broadcaster   │◀──│   Heartbeat   │
//! │ (per request)   │         │ history+registry│   └───────────────┘
//! └───────┬─────────┘         └───────┬─────────┘
//!         │ GET                       │ queue per subscriber
//!         ▼                           ▼
//! ┌─────────────────┐         ┌─────────────────┐
//! │ConnectionHandler│◀────────│  mpsc::Receiver │
//! │  (Sse stream)   │         └─────────────────┘
//! └─────────────────┘
//! ```
//!
//! # Shutdown
//!
//! 1. Stop accepting and wait for the heartbeat to stop
//! 2. Publish the farewell message, close the broadcaster and every subscriber
//! 3. Wait (bounded) for connections to finish draining
//! 4. Wait (bounded) for the audit writer to flush
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and never stop the listener

mod connection;
mod listener;
mod routes;

pub use connection::{CloseReason, ConnectionHandler, ConnectionState, ConnectionSummary};
pub use listener::{ConnectionListener, TrackedStream};
pub use routes::{router, AppState};

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::serve::ListenerExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::audit::{self, AuditError, AuditSummary};
use crate::broadcaster::Broadcaster;
use crate::config::{ConfigError, ServerConfig};
use crate::heartbeat::spawn_heartbeat;

/// Broadcast server bound to a TCP address.
pub struct BroadcastServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    broadcaster: Arc<Broadcaster>,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Open connections
    tracker: TaskTracker,

    audit_task: Option<JoinHandle<Result<AuditSummary, AuditError>>>,
}

impl BroadcastServer {
    /// Validates `config`, opens the audit log if configured, and binds the
    /// listen address.
    pub async fn bind(
        config: ServerConfig,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let mut broadcaster = Broadcaster::new(config.history_capacity, config.subscriber_queue);

        let audit_task = match &config.audit_log {
            Some(path) => {
                let (log, writer) = audit::open(path, config.audit_queue).await?;
                broadcaster = broadcaster.with_audit(log);
                Some(writer.spawn())
            }
            None => None,
        };

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: config.listen_addr,
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            config: Arc::new(config),
            broadcaster: Arc::new(broadcaster),
            cancel_token,
            tracker: TaskTracker::new(),
            audit_task,
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Accept(e.to_string()))
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs the server until the cancellation token fires or the listener
    /// fails, then shuts down in order.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self {
            listener,
            config,
            broadcaster,
            cancel_token,
            tracker,
            audit_task,
        } = self;

        info!(
            addr = ?listener.local_addr().ok(),
            path = %config.path,
            "Broadcast server listening"
        );

        let heartbeat = config.heartbeat_interval().map(|period| {
            spawn_heartbeat(Arc::clone(&broadcaster), period, cancel_token.clone())
        });

        let listener = ConnectionListener::new(
            listener,
            config.write_timeout(),
            tracker.clone(),
            cancel_token.clone(),
        );
        let accept_failure = listener.failure();

        let app = router(AppState::new(Arc::clone(&broadcaster), Arc::clone(&config)))
            .into_make_service_with_connect_info::<SocketAddr>();

        // Fires once every subscriber has been told to close
        let closed = CancellationToken::new();
        let signal = close_on_cancel(
            cancel_token.clone(),
            heartbeat,
            Arc::clone(&broadcaster),
            config.farewell().map(str::to_owned),
            closed.clone(),
        );

        let grace = config.shutdown_timeout();
        // No-op tap: axum implements `Connected` for `SocketAddr` on custom
        // listeners only through `TapIo`
        let serve = axum::serve(listener.tap_io(|_| {}), app)
            .with_graceful_shutdown(signal)
            .into_future();

        let (mut result, drained) = tokio::select! {
            served = serve => (served.map_err(|e| ServerError::Accept(e.to_string())), true),
            _ = async {
                closed.cancelled().await;
                sleep(grace).await;
            } => {
                warn!(
                    remaining = tracker.len(),
                    timeout_ms = grace.as_millis() as u64,
                    "Connections still open after shutdown timeout"
                );
                (Ok(()), false)
            }
        };

        if let Some(e) = accept_failure.get() {
            result = Err(ServerError::Accept(e.clone()));
        }

        // Connection tasks release their tokens just after serve returns
        tracker.close();
        if drained {
            let _ = timeout(grace, tracker.wait()).await;
        }

        if let Some(task) = audit_task {
            match timeout(grace, task).await {
                Ok(Ok(Ok(summary))) => debug!(written = summary.written, "Audit writer finished"),
                Ok(Ok(Err(e))) => error!(error = %e, "Audit writer failed"),
                Ok(Err(e)) => error!(error = %e, "Audit writer task failed"),
                Err(_) => warn!("Audit writer did not finish before shutdown timeout"),
            }
        }

        let open_connections = tracker.len();
        if open_connections == 0 {
            info!("Server stopped");
        } else {
            warn!(open_connections, "Server stopped with connections still open");
        }

        result
    }
}

/// Graceful-shutdown signal for `axum::serve`.
///
/// Once `cancel` fires: waits for the heartbeat, then closes the broadcaster
/// (publishing the farewell) so every subscriber stream ends after draining.
async fn close_on_cancel(
    cancel: CancellationToken,
    heartbeat: Option<JoinHandle<u64>>,
    broadcaster: Arc<Broadcaster>,
    farewell: Option<String>,
    closed: CancellationToken,
) {
    cancel.cancelled().await;
    info!("Server shutdown requested");

    if let Some(handle) = heartbeat {
        match handle.await {
            Ok(ticks) => debug!(ticks, "Heartbeat task finished"),
            Err(e) => error!(error = %e, "Heartbeat task failed"),
        }
    }

    let subscribers = broadcaster.close(farewell.as_deref()).await;
    info!(subscribers, "Closed subscriber streams");
    closed.cancel();
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Audit log error: {0}")]
    Audit(#[from] AuditError),

    #[error("Accept failed: {0}")]
    Accept(String),
}
