//! Protocol errors.

use thiserror::Error;

/// Errors that can occur while decoding an event stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Event too large: more than {max} bytes without a line break")]
    EventTooLarge { max: usize },
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
