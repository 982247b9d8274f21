//! ssecast - command-line client for the broadcast server
//!
//! # Usage
//!
//! ```text
//! ssecast send hello world      # publishes "hello" and "world"
//! ssecast send                  # reads messages from stdin until "exit"
//! ssecast listen                # prints every event, reconnecting as needed
//! ssecast --url http://host:8080/sse/ listen --last-event-id 41
//! ```

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ssecast_client::{
    ListenerConfig, ListenerEvent, Publisher, StreamListener, Url, DEFAULT_ENDPOINT,
};

/// Line that ends interactive input.
const EXIT_COMMAND: &str = "exit";

// ============================================================================
// CLI Arguments
// ============================================================================

/// ssecast - publish to and listen on a broadcast server
#[derive(Parser, Debug)]
#[command(name = "ssecast", version, about)]
struct Args {
    /// Server endpoint
    #[arg(short, long, global = true, default_value = DEFAULT_ENDPOINT)]
    url: Url,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish messages (from arguments, or stdin lines until "exit")
    Send {
        messages: Vec<String>,

        /// Per-message timeout in milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
    /// Subscribe and print every event
    Listen {
        /// Replay only messages after this id
        #[arg(long)]
        last_event_id: Option<String>,

        /// Exit when the stream ends instead of reconnecting
        #[arg(long)]
        no_reconnect: bool,

        /// Upper bound for the reconnect delay in milliseconds
        #[arg(long, default_value_t = 30_000)]
        retry_max_ms: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    run(args)
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ssecast=info".parse()?)
                .add_directive("ssecast_client=warn".parse()?),
        )
        .init();

    match args.command {
        Command::Send {
            messages,
            timeout_ms,
        } => {
            let publisher =
                Publisher::new(args.url).request_timeout(Duration::from_millis(timeout_ms));
            if messages.is_empty() {
                send_interactive(&publisher).await
            } else {
                send_all(&publisher, &messages).await
            }
        }
        Command::Listen {
            last_event_id,
            no_reconnect,
            retry_max_ms,
        } => {
            let config = ListenerConfig {
                retry_max_delay: Duration::from_millis(retry_max_ms),
                reconnect: !no_reconnect,
                ..Default::default()
            };
            listen(args.url, config, last_event_id).await
        }
    }
}

// ============================================================================
// Send
// ============================================================================

/// Publishes one message, logging the outcome. Returns whether it succeeded.
async fn send_one(publisher: &Publisher, message: &str) -> bool {
    match publisher.publish(message).await {
        Ok(id) => {
            info!(message_id = %id, "Message sent");
            true
        }
        Err(e) => {
            error!(error = %e, url = %publisher.url(), "Failed to send message");
            false
        }
    }
}

async fn send_all(publisher: &Publisher, messages: &[String]) -> Result<()> {
    let mut failed = 0usize;
    for message in messages {
        if !send_one(publisher, message).await {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{failed} of {} messages failed", messages.len());
    }
    Ok(())
}

async fn send_interactive(publisher: &Publisher) -> Result<()> {
    eprintln!("Enter messages, one per line. Type \"{EXIT_COMMAND}\" to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim_end_matches('\r');
        if line == EXIT_COMMAND {
            break;
        }
        if line.is_empty() {
            continue;
        }
        send_one(publisher, line).await;
    }
    Ok(())
}

// ============================================================================
// Listen
// ============================================================================

async fn listen(
    url: Url,
    config: ListenerConfig,
    last_event_id: Option<String>,
) -> Result<()> {
    let cancel_token = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let mut listener = StreamListener::new(url, config, event_tx, cancel_token.clone());
    if let Some(id) = last_event_id {
        listener = listener.resume_after(id);
    }
    let listener_task = tokio::spawn(listener.run());

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(ListenerEvent::Event(event)) => {
                    match &event.id {
                        Some(id) => println!("[{id}] {}", event.data),
                        None => println!("{}", event.data),
                    }
                }
                Some(ListenerEvent::Connected { resumed_after }) => {
                    info!(resumed_after = ?resumed_after, "Connected");
                }
                Some(ListenerEvent::Disconnected { reason }) => {
                    warn!(reason = %reason, "Disconnected");
                }
                // Listener finished
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Error waiting for Ctrl+C");
                }
                cancel_token.cancel();
                break;
            }
        }
    }

    listener_task
        .await
        .context("Listener task failed")?
        .context("Listener stopped")
}
