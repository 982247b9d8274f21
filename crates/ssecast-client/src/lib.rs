//! ssecast Client - Publisher and stream listener
//!
//! This library provides the client side used by the `ssecast` CLI:
//!
//! 1. **Publisher**: posts one message per request and returns the id the
//!    server assigned to it
//! 2. **StreamListener**: holds a subscription open, forwards events over a
//!    channel, and reconnects with exponential backoff, resuming from the
//!    last event id it saw
//!
//! Both talk HTTP through `reqwest` and respect a `CancellationToken` or a
//! request timeout so callers can shut down promptly.

pub mod error;
pub mod listener;
pub mod publisher;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use listener::{next_delay, EventStream, ListenerConfig, ListenerEvent, StreamListener};
pub use publisher::Publisher;
pub use reqwest::Url;

/// Endpoint of a server running with default settings on this host.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:52799/sse/";
