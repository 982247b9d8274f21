//! ssecast Protocol - Wire format for the broadcast server
//!
//! This crate provides the event framing shared by the daemon and its
//! subscribers:
//! - `event` - line splitting for `data:` fields and an incremental decoder
//! - `error` - protocol errors

pub mod error;
pub mod event;

pub use error::ProtocolError;
pub use event::{data_lines, decode_stream, event_data, SseDecoder, SseEvent, MAX_EVENT_LINE};
