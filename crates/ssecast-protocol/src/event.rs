//! Server-sent event framing.
//!
//! Every broadcast message travels as one event:
//!
//! ```text
//! id: 42
//! data: first payload line
//! data: second payload line
//!
//! ```
//!
//! A single-line payload therefore produces exactly `id: <id>\ndata: <payload>\n\n`.
//! `\r\n`, `\r` and `\n` all end a line on the wire, so a payload is split on
//! any of them before it becomes `data:` lines; a bare `\r` in the payload
//! cannot start a new field. The decoder is the subscriber side of the same
//! format and follows the field rules of the event-stream convention
//! (comments, `event`, `id`, `retry`, multi-line `data`).

use std::borrow::Cow;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use futures::{Stream, StreamExt};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

use ssecast_core::MessageId;

use crate::error::ProtocolError;

/// Longest line the decoder buffers before giving up.
pub const MAX_EVENT_LINE: usize = 2 * 1024 * 1024;

/// Splits a payload into the lines carried by its `data:` fields.
///
/// `\r\n`, a lone `\r` and `\n` each end a line.
pub fn data_lines(payload: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(payload);
    std::iter::from_fn(move || {
        let text = rest?;
        match text.find(['\r', '\n']) {
            Some(at) => {
                let (line, tail) = text.split_at(at);
                let skip = if tail.starts_with("\r\n") { 2 } else { 1 };
                rest = tail.get(skip..);
                Some(line)
            }
            None => {
                rest = None;
                Some(text)
            }
        }
    })
}

/// The payload with every line break normalized to `\n`.
///
/// This is the value a subscriber reassembles from the `data:` lines.
pub fn event_data(payload: &str) -> Cow<'_, str> {
    if !payload.contains('\r') {
        return Cow::Borrowed(payload);
    }
    Cow::Owned(data_lines(payload).collect::<Vec<_>>().join("\n"))
}

/// One decoded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Last event id seen on the stream when this event was dispatched
    pub id: Option<String>,
    /// Event type, `None` for the default `message` type
    pub event: Option<String>,
    /// Data lines joined with `\n`
    pub data: String,
    /// Reconnection delay requested by the server, in milliseconds
    pub retry: Option<u64>,
}

impl SseEvent {
    /// The event id as a broadcast message id, if it is one.
    pub fn message_id(&self) -> Option<MessageId> {
        self.id.as_deref().and_then(|id| id.parse().ok())
    }
}

/// Incremental event-stream decoder.
#[derive(Debug)]
pub struct SseDecoder {
    data: Option<Vec<String>>,
    event: Option<String>,
    retry: Option<u64>,
    last_event_id: Option<String>,
    max_line: usize,
    /// Bytes at the front of the buffer already searched for a line break
    scanned: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::with_max_line(MAX_EVENT_LINE)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            data: None,
            event: None,
            retry: None,
            last_event_id: None,
            max_line,
            scanned: 0,
        }
    }

    /// The most recent `id` field seen, used to resume a dropped stream.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Applies one line (without its terminator). Returns an event when the
    /// line is the blank line that ends one.
    fn process_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        if line.first() == Some(&b':') {
            return None;
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*line, ""),
        };

        match field {
            "data" => self.data.get_or_insert_with(Vec::new).push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" => self.retry = value.parse().ok().or(self.retry),
            _ => {}
        }

        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let data = self.data.take()?;

        Some(SseEvent {
            id: self.last_event_id.clone(),
            event,
            data: data.join("\n"),
            retry: self.retry,
        })
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SseDecoder {
    type Item = SseEvent;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let start = self.scanned.min(src.len());
            let found = src
                .get(start..)
                .and_then(|rest| rest.iter().position(|b| *b == b'\n' || *b == b'\r'));
            let Some(offset) = found else {
                if src.len() > self.max_line {
                    return Err(ProtocolError::EventTooLarge { max: self.max_line });
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let end = start + offset;
            let terminator = match src.get(end..end + 2) {
                Some(b"\r\n") => 2,
                // A trailing `\r` may be the first half of `\r\n`
                None if src.get(end) == Some(&b'\r') => {
                    self.scanned = end;
                    return Ok(None);
                }
                _ => 1,
            };

            self.scanned = 0;
            let line = src.split_to(end + terminator);
            let line = line.get(..end).unwrap_or_default();

            if let Some(event) = self.process_line(line) {
                return Ok(Some(event));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.last() == Some(&b'\r') {
            src.put_u8(b'\n');
        }
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }

        // An event cut off by end of stream is discarded
        src.clear();
        self.scanned = 0;
        self.data = None;
        self.event = None;
        Ok(None)
    }
}

/// Decodes events from a stream of body chunks, such as an HTTP response body.
///
/// An event still incomplete when the body ends is dropped.
pub fn decode_stream<S, B, E>(body: S) -> impl Stream<Item = Result<SseEvent, ProtocolError>>
where
    S: Stream<Item = Result<B, E>>,
    B: Buf,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let reader = StreamReader::new(body.map(|chunk| chunk.map_err(io::Error::other)));
    FramedRead::new(reader, SseDecoder::new())
}
