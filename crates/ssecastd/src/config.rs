//! Server configuration.
//!
//! Loading order, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. TOML file (`ServerConfig::load`)
//! 3. `SSECAST_*` environment variables (`apply_env_overrides`)
//! 4. Command-line flags (applied by the binary)
//!
//! Does NOT validate on load - call [`ServerConfig::validate`] once every
//! source has been applied.
//!
//! ```toml
//! listen_addr = "127.0.0.1:52799"
//! path = "/sse/"
//! history_capacity = 100
//! heartbeat_interval_ms = 1000   # 0 disables the heartbeat
//! subscriber_queue = 256
//! audit_log = "/var/log/ssecast/audit.jsonl"
//! audit_queue = 1024             # messages buffered for the audit writer
//! farewell_message = ""          # empty disables the farewell
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::registry::DEFAULT_QUEUE_CAPACITY;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:52799";

/// Default route for both publishing and subscribing.
pub const DEFAULT_PATH: &str = "/sse/";

/// Published to every subscriber just before shutdown.
pub const DEFAULT_FAREWELL: &str = "The server closes the connection.";

/// Default number of messages buffered for the audit writer.
pub const DEFAULT_AUDIT_QUEUE: usize = 1024;

/// Environment variable overriding `listen_addr`.
pub const ENV_LISTEN_ADDR: &str = "SSECAST_ADDR";

/// Environment variable overriding `audit_log`.
pub const ENV_AUDIT_LOG: &str = "SSECAST_AUDIT_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub path: String,
    pub history_capacity: usize,
    pub heartbeat_interval_ms: u64,
    pub subscriber_queue: usize,
    pub write_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_body_size: usize,
    pub audit_log: Option<PathBuf>,
    pub audit_queue: usize,
    pub farewell_message: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 52799)),
            path: DEFAULT_PATH.to_string(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            heartbeat_interval_ms: 1000,
            subscriber_queue: DEFAULT_QUEUE_CAPACITY,
            write_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            shutdown_timeout_ms: 15_000,
            max_body_size: 1_048_576,
            audit_log: None,
            audit_queue: DEFAULT_AUDIT_QUEUE,
            farewell_message: Some(DEFAULT_FAREWELL.to_string()),
        }
    }
}

impl ServerConfig {
    /// Parses a TOML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Toml { error, .. } => ConfigError::Toml {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Toml {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Applies `SSECAST_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_LISTEN_ADDR) {
            self.listen_addr = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_LISTEN_ADDR,
                value,
            })?;
        }

        if let Some(value) = lookup(ENV_AUDIT_LOG) {
            self.audit_log = if value.is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }

        Ok(())
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::invalid("path", "must start with '/'"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::invalid("history_capacity", "must be at least 1"));
        }
        if self.subscriber_queue == 0 {
            return Err(ConfigError::invalid("subscriber_queue", "must be at least 1"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::invalid("write_timeout_ms", "must be positive"));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::invalid("read_timeout_ms", "must be positive"));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::invalid("shutdown_timeout_ms", "must be positive"));
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::invalid("max_body_size", "must be positive"));
        }
        if self.audit_queue == 0 {
            return Err(ConfigError::invalid("audit_queue", "must be at least 1"));
        }
        Ok(())
    }

    /// `None` when the heartbeat is disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// `None` when the farewell is disabled (unset or empty).
    pub fn farewell(&self) -> Option<&str> {
        self.farewell_message.as_deref().filter(|text| !text.is_empty())
    }

    /// Logs the effective configuration.
    pub fn log_summary(&self) {
        info!(
            listen_addr = %self.listen_addr,
            path = %self.path,
            history_capacity = self.history_capacity,
            heartbeat_interval_ms = self.heartbeat_interval_ms,
            subscriber_queue = self.subscriber_queue,
            audit_log = ?self.audit_log,
            audit_queue = self.audit_queue,
            "Configuration loaded"
        );
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config {path}: {error}")]
    Toml { path: PathBuf, error: String },

    #[error("Invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },

    #[error("Invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}
