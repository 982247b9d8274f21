//! Error types for the ssecast client.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use thiserror::Error;

use ssecast_protocol::ProtocolError;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors returned by the publisher and the stream listener.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The request could not be sent or its response not read.
    ///
    /// Usually the server is not running or listens on another address.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server answered with a non-success status.
    #[error("Server rejected request: {status} {reason} {body}")]
    Rejected {
        status: u16,
        reason: String,
        body: String,
    },

    /// The server answered 2xx but the body was not what was expected.
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation was cancelled through its cancellation token.
    #[error("Cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether retrying the same request later may succeed.
    ///
    /// Server-side rejections of the request itself (4xx) are permanent, as
    /// is a request that could not be built; transport failures and 5xx
    /// answers are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder(),
            Self::Timeout(_) | Self::Protocol(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::InvalidResponse(_) | Self::Cancelled => false,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
