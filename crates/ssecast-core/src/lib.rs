//! ssecast Core - Shared types for the broadcast server
//!
//! This crate provides the core domain types shared between
//! the daemon (ssecastd), the wire protocol and the client.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod message;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use message::{Message, MessageId};
