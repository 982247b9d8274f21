//! ssecast daemon - message history, subscriber registry and broadcast server
//!
//! This crate provides the server side of ssecast:
//! - `history` - bounded replay buffer; assigns message ids
//! - `registry` - live subscribers, each with a bounded delivery queue
//! - `broadcaster` - the single publish path into history and registry
//! - `heartbeat` - periodic heartbeat messages
//! - `audit` - optional JSON-lines record of every published message
//! - `config` - server configuration (defaults, TOML, environment)
//! - `server` - axum routes, connection listener and per-subscriber streams
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ssecastd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐  publish  ┌─────────────────────────┐  │
//! │  │ BroadcastServer │──────────▶│      Broadcaster        │  │
//! │  │  (axum Router)  │           │ MessageHistory          │  │
//! │  └────────┬────────┘           │ ClientRegistry          │  │
//! │           │ subscribe          └────────────┬────────────┘  │
//! │           ▼                                 │ try_send      │
//! │  ┌─────────────────┐   mpsc per subscriber  │               │
//! │  │ConnectionHandler│◀───────────────────────┘               │
//! │  │  (Sse stream)   │                                        │
//! │  └─────────────────┘                                        │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows a panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod audit;
pub mod broadcaster;
pub mod config;
pub mod heartbeat;
pub mod history;
pub mod registry;
pub mod server;

pub use broadcaster::{BroadcastError, Broadcaster, Subscription};
pub use config::{ConfigError, ServerConfig};
pub use history::MessageHistory;
pub use registry::{ClientRegistry, SubscriberId};
pub use server::{BroadcastServer, ServerError};
