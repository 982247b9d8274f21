//! Integration tests for the broadcast server.
//!
//! These tests run a real `BroadcastServer` on an ephemeral TCP port and
//! talk to it over HTTP with `reqwest`: publishing, subscribing, replay,
//! resume, heartbeats and graceful shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use ssecast_protocol::{decode_stream, ProtocolError, SseEvent};
use ssecastd::{BroadcastServer, Broadcaster, ServerConfig, ServerError};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on anything a test waits for
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between registry polls
const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle.
struct TestServer {
    addr: SocketAddr,
    client: Client,
    broadcaster: Arc<Broadcaster>,
    cancel_token: CancellationToken,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    /// Spawns a server with heartbeats disabled.
    async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    async fn spawn_with(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let mut config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat_interval_ms: 0,
            shutdown_timeout_ms: 2_000,
            ..ServerConfig::default()
        };
        configure(&mut config);

        let cancel_token = CancellationToken::new();
        let server = BroadcastServer::bind(config, cancel_token.clone())
            .await
            .expect("bind server");
        let addr = server.local_addr().unwrap();
        let broadcaster = server.broadcaster();
        let handle = tokio::spawn(server.run());

        Self {
            addr,
            client: Client::new(),
            broadcaster,
            cancel_token,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Publishes one payload and returns the status and body.
    async fn publish(&self, payload: &str) -> (StatusCode, String) {
        publish_to(&self.client, &self.url("/sse/"), payload).await
    }

    /// Opens a subscription and waits until the server has registered it.
    async fn subscribe(&self, last_event_id: Option<u64>) -> Subscriber {
        let before = self.broadcaster.registry().len().await;
        let subscriber = Subscriber::connect(&self.client, &self.url("/sse/"), last_event_id).await;
        self.wait_for_subscribers(before + 1).await;
        subscriber
    }

    async fn wait_for_subscribers(&self, count: usize) {
        let registry = self.broadcaster.registry();
        timeout(WAIT_TIMEOUT, async {
            while registry.len().await != count {
                sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} subscribers"));
    }

    /// Shuts the server down and waits for `run` to return.
    async fn shutdown(self) -> Result<(), ServerError> {
        self.cancel_token.cancel();
        timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("server stopped in time")
            .expect("server task")
    }
}

async fn publish_to(client: &Client, url: &str, payload: &str) -> (StatusCode, String) {
    let response = client
        .post(url)
        .body(payload.to_string())
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.text().await.unwrap())
}

/// An open event stream.
struct Subscriber {
    events: BoxStream<'static, Result<SseEvent, ProtocolError>>,
}

impl Subscriber {
    async fn connect(client: &Client, url: &str, last_event_id: Option<u64>) -> Self {
        let mut request = client.get(url).header(ACCEPT, "text/event-stream");
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id.to_string());
        }

        let response = request.send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        Self {
            events: decode_stream(response.bytes_stream()).boxed(),
        }
    }

    async fn next(&mut self) -> SseEvent {
        timeout(WAIT_TIMEOUT, self.events.next())
            .await
            .expect("event in time")
            .expect("stream still open")
            .unwrap()
    }

    async fn next_data(&mut self) -> String {
        self.next().await.data
    }

    /// Reads until the server closes the stream.
    async fn remaining(&mut self) -> Vec<String> {
        let mut data = Vec::new();
        while let Some(event) = timeout(WAIT_TIMEOUT, self.events.next())
            .await
            .expect("stream closed in time")
        {
            data.push(event.unwrap().data);
        }
        data
    }
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test]
async fn test_publish_without_subscribers() {
    let server = TestServer::spawn().await;

    let response = server
        .client
        .post(server.url("/sse/"))
        .header("Origin", "http://example.com")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
    assert_eq!(response.text().await.unwrap(), "1");

    let (_, body) = server.publish("world").await;
    assert_eq!(body, "2");

    assert_eq!(server.broadcaster.history().len().await, 2);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_path_without_trailing_slash() {
    let server = TestServer::spawn().await;

    let (status, body) = publish_to(&server.client, &server.url("/sse"), "x").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "1");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_responses() {
    let server = TestServer::spawn().await;
    let client = &server.client;

    let response = client.get(server.url("/elsewhere")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.put(server.url("/sse/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    let allow = response.headers().get("allow").unwrap().to_str().unwrap();
    assert!(allow.contains("GET") && allow.contains("POST"), "{allow}");

    let (status, _) = server.publish("").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = client
        .request(reqwest::Method::OPTIONS, server.url("/sse"))
        .header("Origin", "http://example.com")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .contains_key("access-control-allow-methods"));

    // Nothing above was published
    let (status, body) = server.publish("still fine").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "1");

    server.shutdown().await.unwrap();
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_replay_then_live() {
    let server = TestServer::spawn_with(|c| c.history_capacity = 3).await;
    for payload in ["a", "b", "c", "d"] {
        server.publish(payload).await;
    }

    let mut sub = server.subscribe(None).await;
    assert_eq!(sub.next_data().await, "b");
    assert_eq!(sub.next_data().await, "c");
    assert_eq!(sub.next_data().await, "d");

    server.publish("e").await;
    let event = sub.next().await;
    assert_eq!(event.data, "e");
    assert_eq!(event.id.as_deref(), Some("5"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_early_subscriber_sees_message_once_late_never() {
    let server = TestServer::spawn_with(|c| c.history_capacity = 1).await;

    let mut early = server.subscribe(None).await;
    server.publish("x").await;
    server.publish("y").await;

    // "x" has been evicted by the time the late subscriber connects
    let mut late = server.subscribe(None).await;
    server.publish("z").await;

    assert_eq!(early.next_data().await, "x");
    assert_eq!(early.next_data().await, "y");
    assert_eq!(early.next_data().await, "z");

    assert_eq!(late.next_data().await, "y");
    assert_eq!(late.next_data().await, "z");

    let farewell = ssecastd::config::DEFAULT_FAREWELL.to_string();
    server.shutdown().await.unwrap();
    assert_eq!(early.remaining().await, vec![farewell.clone()]);
    assert_eq!(late.remaining().await, vec![farewell]);
}

#[tokio::test]
async fn test_resume_with_last_event_id() {
    let server = TestServer::spawn().await;
    server.publish("x").await;
    server.publish("y").await;

    let mut resumed = server.subscribe(Some(1)).await;
    assert_eq!(resumed.next_data().await, "y");

    server.publish("z").await;
    assert_eq!(resumed.next_data().await, "z");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_all_subscribers_see_same_order() {
    let server = TestServer::spawn().await;
    let mut subs = Vec::new();
    for _ in 0..3 {
        subs.push(server.subscribe(None).await);
    }

    let url = server.url("/sse/");
    let mut publishers = Vec::new();
    for task in 0..4 {
        let client = server.client.clone();
        let url = url.clone();
        publishers.push(tokio::spawn(async move {
            for i in 0..10 {
                let (status, _) = publish_to(&client, &url, &format!("{task}-{i}")).await;
                assert_eq!(status, StatusCode::OK);
            }
        }));
    }
    for publisher in publishers {
        publisher.await.unwrap();
    }

    let mut streams = Vec::new();
    for sub in &mut subs {
        let mut ids = Vec::new();
        for _ in 0..40 {
            ids.push(sub.next().await.message_id().unwrap().get());
        }
        streams.push(ids);
    }

    let expected: Vec<u64> = (1..=40).collect();
    for ids in streams {
        assert_eq!(ids, expected);
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_multi_line_payload() {
    let server = TestServer::spawn().await;
    let mut sub = server.subscribe(None).await;

    server.publish("first\nsecond").await;
    assert_eq!(sub.next_data().await, "first\nsecond");

    server.publish("a\r\rid: 999\rdata: forged").await;
    let event = sub.next().await;
    assert_eq!(event.id.as_deref(), Some("2"));
    assert_eq!(event.data, "a\n\nid: 999\ndata: forged");

    server.publish("after").await;
    assert_eq!(sub.next_data().await, "after");

    server.shutdown().await.unwrap();
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test]
async fn test_heartbeats_reach_subscribers() {
    let server = TestServer::spawn_with(|c| c.heartbeat_interval_ms = 20).await;
    let mut sub = server.subscribe(None).await;

    let mut counters = Vec::new();
    while counters.len() < 3 {
        let data = sub.next_data().await;
        assert!(data.starts_with("heartbeat #"), "unexpected event {data:?}");
        counters.push(data);
    }

    server.shutdown().await.unwrap();
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_sends_farewell_and_closes() {
    let server = TestServer::spawn_with(|c| c.farewell_message = Some("goodbye".into())).await;
    let addr = server.addr;
    let mut sub = server.subscribe(None).await;
    server.publish("last").await;

    server.shutdown().await.unwrap();

    assert_eq!(sub.remaining().await, vec!["last", "goodbye"]);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_without_farewell() {
    let server = TestServer::spawn_with(|c| c.farewell_message = None).await;
    let mut sub = server.subscribe(None).await;

    server.shutdown().await.unwrap();
    assert!(sub.remaining().await.is_empty());
}

#[tokio::test]
async fn test_audit_log_records_published_messages() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let audit_path = path.clone();
    let server = TestServer::spawn_with(move |c| c.audit_log = Some(audit_path)).await;

    server.publish("one").await;
    server.publish("two").await;
    server.shutdown().await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let payloads: Vec<String> = contents
        .lines()
        .map(|line| {
            let record: serde_json::Value = serde_json::from_str(line).unwrap();
            record["payload"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(
        payloads,
        vec!["one", "two", ssecastd::config::DEFAULT_FAREWELL]
    );
}
