//! HTTP routes on the configured path.
//!
//! | Request            | Result                                          |
//! |--------------------|-------------------------------------------------|
//! | `GET <path>`       | event stream driven by a [`ConnectionHandler`]  |
//! | `POST <path>`      | body published, `200` with the message id       |
//! | CORS preflight     | answered by the CORS layer                      |
//! | other method       | `405` with `Allow`                              |
//! | other path         | `404`                                           |
//!
//! The path matches with or without its trailing slash. The payload is never
//! interpreted. Producing a response (reading a publish body included) is
//! bounded by the read timeout.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::Router;
use futures::StreamExt;
use tokio::time::timeout;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use ssecast_core::{Message, MessageId};
use ssecast_protocol::event_data;

use crate::broadcaster::{BroadcastError, Broadcaster};
use crate::config::ServerConfig;
use crate::server::connection::ConnectionHandler;

/// Shared state for every request.
#[derive(Debug, Clone)]
pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(broadcaster: Arc<Broadcaster>, config: Arc<ServerConfig>) -> Self {
        Self {
            broadcaster,
            config,
        }
    }
}

/// Builds the router for the publish/subscribe path.
pub fn router(state: AppState) -> Router {
    let base = state.config.path.trim_end_matches('/').to_owned();
    let endpoint = || -> MethodRouter<AppState> { get(subscribe).post(publish) };

    let router = if base.is_empty() {
        Router::new().route("/", endpoint())
    } else {
        Router::new()
            .route(&base, endpoint())
            .route(&format!("{base}/"), endpoint())
    };

    router
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(state.config.max_body_size))
        .layer(middleware::from_fn_with_state(state.clone(), read_deadline))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Opens an event stream: replay, then live messages.
async fn subscribe(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let resume_after = last_event_id(&headers, peer);

    let handler = match ConnectionHandler::connect(
        Arc::clone(&state.broadcaster),
        resume_after,
        Some(peer),
    )
    .await
    {
        Ok(handler) => handler,
        Err(BroadcastError::Closed) => return unavailable(),
    };

    info!(
        peer = %peer,
        subscriber_id = %handler.subscriber_id(),
        resume_after = ?resume_after.map(MessageId::get),
        "Subscriber connected"
    );

    let events = handler
        .into_stream()
        .map(|message| Ok::<_, Infallible>(message_event(&message)));

    (
        [(header::CONNECTION, "keep-alive")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// Publishes the request body and answers with the assigned id.
async fn publish(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(
                peer = %peer,
                status = rejection.status().as_u16(),
                error = %rejection.body_text(),
                "Rejected request"
            );
            return rejection.into_response();
        }
    };

    if body.is_empty() {
        warn!(peer = %peer, "Publish without a body");
        return (StatusCode::BAD_REQUEST, "Missing message body").into_response();
    }

    match state.broadcaster.publish(body).await {
        Ok(message) => {
            info!(
                peer = %peer,
                message_id = %message.id(),
                bytes = message.payload().len(),
                "Message published"
            );
            (StatusCode::OK, message.id().to_string()).into_response()
        }
        Err(BroadcastError::Closed) => unavailable(),
    }
}

async fn not_found(uri: Uri) -> Response {
    warn!(path = %uri.path(), "Unknown path");
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

/// Answers `408` when no response is ready within the read timeout.
async fn read_deadline(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let limit = state.config.read_timeout();
    match timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            debug!(timeout_ms = limit.as_millis() as u64, "Timed out reading request");
            (StatusCode::REQUEST_TIMEOUT, "Request timeout").into_response()
        }
    }
}

/// One message as an event: its id, then one `data:` line per payload line.
fn message_event(message: &Message) -> Event {
    let payload = message.payload_lossy();
    Event::default()
        .id(message.id().to_string())
        .data(event_data(&payload))
}

fn last_event_id(headers: &HeaderMap, peer: SocketAddr) -> Option<MessageId> {
    let value = headers.get("last-event-id")?.to_str().ok()?;
    match value.trim().parse() {
        Ok(id) => Some(id),
        Err(e) => {
            debug!(peer = %peer, error = %e, "Ignoring Last-Event-ID");
            None
        }
    }
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response()
}
