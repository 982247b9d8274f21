//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A message id could not be parsed (e.g. from a `Last-Event-ID` header)
    #[error("Invalid message id: {value:?} (expected an unsigned integer)")]
    InvalidMessageId { value: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
