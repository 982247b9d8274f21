//! End-to-end tests of the publisher and listener against a real server.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use ssecast_client::{ClientError, ListenerConfig, ListenerEvent, Publisher, StreamListener, Url};
use ssecast_core::MessageId;
use ssecastd::{BroadcastServer, Broadcaster, ServerConfig};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(
    configure: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<Broadcaster>, CancellationToken) {
    let mut config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_interval_ms: 0,
        shutdown_timeout_ms: 2_000,
        ..ServerConfig::default()
    };
    configure(&mut config);

    let cancel = CancellationToken::new();
    let server = BroadcastServer::bind(config, cancel.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let broadcaster = server.broadcaster();
    tokio::spawn(server.run());

    (addr, broadcaster, cancel)
}

fn endpoint(addr: SocketAddr) -> Url {
    format!("http://{addr}/sse/").parse().unwrap()
}

fn fast_config() -> ListenerConfig {
    ListenerConfig {
        retry_initial_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(100),
        ..Default::default()
    }
}

/// Next event data, skipping connection notices.
async fn next_data(rx: &mut mpsc::UnboundedReceiver<ListenerEvent>) -> String {
    loop {
        match timeout(WAIT_TIMEOUT, rx.recv()).await.unwrap().unwrap() {
            ListenerEvent::Event(event) => return event.data,
            ListenerEvent::Connected { .. } | ListenerEvent::Disconnected { .. } => {}
        }
    }
}

#[tokio::test]
async fn test_publisher_gets_sequential_ids() {
    let (addr, _, cancel) = start_server(|_| {}).await;
    let publisher = Publisher::new(endpoint(addr));

    assert_eq!(publisher.publish("one").await.unwrap(), MessageId::new(1));
    assert_eq!(publisher.publish("two").await.unwrap(), MessageId::new(2));

    cancel.cancel();
}

#[tokio::test]
async fn test_publisher_empty_message_rejected() {
    let (addr, _, cancel) = start_server(|_| {}).await;

    let err = Publisher::new(endpoint(addr)).publish("").await.unwrap_err();

    assert!(matches!(err, ClientError::Rejected { status: 400, .. }));
    assert!(!err.is_retryable());
    cancel.cancel();
}

#[tokio::test]
async fn test_listener_receives_replay_and_live_messages() {
    let (addr, broadcaster, cancel) = start_server(|c| c.history_capacity = 2).await;
    let publisher = Publisher::new(endpoint(addr));
    for payload in ["a", "b", "c"] {
        publisher.publish(payload).await.unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener_cancel = CancellationToken::new();
    let listener = StreamListener::new(endpoint(addr), fast_config(), tx, listener_cancel.clone());
    let task = tokio::spawn(listener.run());

    assert_eq!(next_data(&mut rx).await, "b");
    assert_eq!(next_data(&mut rx).await, "c");

    timeout(WAIT_TIMEOUT, async {
        while broadcaster.registry().len().await != 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    publisher.publish("d").await.unwrap();
    assert_eq!(next_data(&mut rx).await, "d");

    listener_cancel.cancel();
    task.await.unwrap().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn test_listener_resumes_after_last_event_id() {
    let (addr, _, cancel) = start_server(|_| {}).await;
    let publisher = Publisher::new(endpoint(addr));
    for payload in ["a", "b", "c"] {
        publisher.publish(payload).await.unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener_cancel = CancellationToken::new();
    let listener = StreamListener::new(endpoint(addr), fast_config(), tx, listener_cancel.clone())
        .resume_after("2");
    let task = tokio::spawn(listener.run());

    assert_eq!(next_data(&mut rx).await, "c");

    listener_cancel.cancel();
    task.await.unwrap().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn test_listener_sees_farewell_on_shutdown() {
    let (addr, broadcaster, cancel) = start_server(|_| {}).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = ListenerConfig {
        reconnect: false,
        ..fast_config()
    };
    let listener = StreamListener::new(endpoint(addr), config, tx, CancellationToken::new());
    let task = tokio::spawn(listener.run());

    timeout(WAIT_TIMEOUT, async {
        while broadcaster.registry().len().await != 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();

    assert_eq!(next_data(&mut rx).await, ssecastd::config::DEFAULT_FAREWELL);
    timeout(WAIT_TIMEOUT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_listener_receives_carriage_return_payload_as_one_event() {
    let (addr, broadcaster, cancel) = start_server(|_| {}).await;
    let publisher = Publisher::new(endpoint(addr));
    publisher.publish("a\r\rid: 999\rdata: forged").await.unwrap();
    publisher.publish("next").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener_cancel = CancellationToken::new();
    let listener = StreamListener::new(endpoint(addr), fast_config(), tx, listener_cancel.clone());
    let task = tokio::spawn(listener.run());

    assert_eq!(next_data(&mut rx).await, "a\n\nid: 999\ndata: forged");
    assert_eq!(next_data(&mut rx).await, "next");
    assert_eq!(broadcaster.history().len().await, 2);

    listener_cancel.cancel();
    task.await.unwrap().unwrap();
    cancel.cancel();
}
