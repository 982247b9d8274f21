//! ssecast daemon - server-sent events broadcast server
//!
//! Accepts messages over HTTP `POST` and streams every message, plus a
//! replay of recent history, to each subscriber holding a `GET` open.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:52799, path /sse/, 100 messages of history
//! ssecastd
//!
//! # Load a TOML file, then override single settings
//! ssecastd --config ssecast.toml --listen 127.0.0.1:8080 --heartbeat-ms 0
//! ```
//!
//! Configuration precedence, lowest first: defaults, `--config` file,
//! environment (`SSECAST_ADDR`, `SSECAST_AUDIT_LOG`), command-line flags.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ssecastd::{BroadcastServer, ServerConfig};

/// ssecast daemon - broadcast server with history replay and heartbeat
#[derive(Parser, Debug)]
#[command(name = "ssecastd", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// URL path serving both publish and subscribe
    #[arg(long)]
    path: Option<String>,

    /// Number of messages retained for replay
    #[arg(long)]
    history: Option<usize>,

    /// Heartbeat interval in milliseconds (0 disables heartbeats)
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Append every published message to this JSON-lines file
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Close subscriber streams without a farewell message
    #[arg(long)]
    no_farewell: bool,
}

impl Args {
    /// Builds the effective configuration from every source.
    fn load_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        config
            .apply_env_overrides()
            .context("Invalid environment override")?;

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if let Some(history) = self.history {
            config.history_capacity = history;
        }
        if let Some(heartbeat_ms) = self.heartbeat_ms {
            config.heartbeat_interval_ms = heartbeat_ms;
        }
        if let Some(audit_log) = &self.audit_log {
            config.audit_log = Some(audit_log.clone());
        }
        if self.no_farewell {
            config.farewell_message = None;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    run_daemon(config)
}

#[tokio::main]
async fn run_daemon(config: ServerConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ssecastd=info".parse()?)
                .add_directive("ssecast_core=info".parse()?)
                .add_directive("ssecast_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "ssecast daemon starting"
    );
    config.log_summary();

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let server = BroadcastServer::bind(config, cancel_token)
        .await
        .context("Failed to start server")?;

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("ssecast daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
