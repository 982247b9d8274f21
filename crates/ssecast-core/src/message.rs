//! Broadcast message types.
//!
//! A [`Message`] is created exactly once, by the broadcaster, when a payload
//! is published. It is immutable afterwards and cheap to clone: the payload
//! is reference counted via [`Bytes`], so fanning a message out to many
//! subscribers never copies the payload.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Sequence id assigned to a message at publish time.
///
/// Ids start at 1, strictly increase and are never reused within one
/// server lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// The first id handed out by a fresh history.
    pub const FIRST: MessageId = MessageId(1);

    /// Creates a message id from its raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw numeric value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the id that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| DomainError::InvalidMessageId {
                value: s.to_string(),
            })
    }
}

/// A published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    payload: Bytes,
    created_at: DateTime<Utc>,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self::with_timestamp(id, payload, Utc::now())
    }

    /// Creates a message with an explicit creation time.
    pub fn with_timestamp(
        id: MessageId,
        payload: impl Into<Bytes>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payload: payload.into(),
            created_at,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Raw payload bytes, exactly as published.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
