//! Append-only audit log of published messages.
//!
//! The broadcaster hands every published message to an [`AuditLog`] without
//! waiting; an [`AuditWriter`] task appends one JSON object per line to the
//! configured file. The writer finishes once every `AuditLog` handle has been
//! dropped and the queue is drained.
//!
//! Recording is best-effort. Publishing never waits on the file, so a message
//! that finds the queue full is not recorded. Such drops are counted and
//! reported when the writer finishes.
//!
//! ```text
//! {"id":1,"created_at":"2026-01-01T00:00:00Z","payload":"hello"}
//! ```

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ssecast_core::{Message, MessageId};

/// One line of the audit file.
#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    id: MessageId,
    created_at: DateTime<Utc>,
    payload: Cow<'a, str>,
}

impl<'a> From<&'a Message> for AuditRecord<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            id: message.id(),
            created_at: message.created_at(),
            payload: message.payload_lossy(),
        }
    }
}

/// Sending side of the audit queue.
#[derive(Debug, Clone)]
pub struct AuditLog {
    sender: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
}

impl AuditLog {
    /// Queues a message for the audit file. Never waits.
    ///
    /// A full queue drops the message and counts it.
    pub fn record(&self, message: &Message) {
        match self.sender.try_send(message.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(message_id = %message.id(), dropped, "Audit queue full, message not recorded");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(message_id = %message.id(), "Audit writer stopped, message not recorded");
            }
        }
    }
}

/// Task that owns the audit file.
#[derive(Debug)]
pub struct AuditWriter {
    path: PathBuf,
    file: BufWriter<File>,
    receiver: mpsc::Receiver<Message>,
    dropped: Arc<AtomicU64>,
}

/// What the writer did before it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditSummary {
    pub written: u64,
    /// Messages turned away by a full queue
    pub dropped: u64,
}

/// Opens (or creates) the audit file for appending, with room for `capacity`
/// queued messages.
pub async fn open(
    path: impl AsRef<Path>,
    capacity: usize,
) -> Result<(AuditLog, AuditWriter), AuditError> {
    let path = path.as_ref().to_path_buf();

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|e| AuditError::Open {
            path: path.clone(),
            error: e.to_string(),
        })?;

    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));

    Ok((
        AuditLog {
            sender,
            dropped: Arc::clone(&dropped),
        },
        AuditWriter {
            path,
            file: BufWriter::new(file),
            receiver,
            dropped,
        },
    ))
}

impl AuditWriter {
    /// Writes queued messages until every [`AuditLog`] is dropped.
    ///
    /// A failed line is logged and skipped.
    pub async fn run(mut self) -> Result<AuditSummary, AuditError> {
        info!(path = %self.path.display(), "Audit log opened");

        let mut written = 0u64;
        while let Some(message) = self.receiver.recv().await {
            match self.write_line(&message).await {
                Ok(()) => written += 1,
                Err(e) => {
                    error!(
                        path = %self.path.display(),
                        message_id = %message.id(),
                        error = %e,
                        "Failed to write audit record"
                    );
                }
            }
        }

        self.file
            .shutdown()
            .await
            .map_err(|e| AuditError::Write(e.to_string()))?;

        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(
                path = %self.path.display(),
                written,
                dropped,
                "Audit log closed, messages dropped while the queue was full"
            );
        } else {
            info!(path = %self.path.display(), written, "Audit log closed");
        }

        Ok(AuditSummary { written, dropped })
    }

    /// Spawns [`run`](Self::run) on the runtime.
    pub fn spawn(self) -> JoinHandle<Result<AuditSummary, AuditError>> {
        tokio::spawn(self.run())
    }

    async fn write_line(&mut self, message: &Message) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&AuditRecord::from(message))
            .map_err(|e| AuditError::Serialize(e.to_string()))?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .map_err(|e| AuditError::Write(e.to_string()))?;
        self.file
            .flush()
            .await
            .map_err(|e| AuditError::Write(e.to_string()))
    }
}

/// Errors from the audit sink.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to open audit log {path}: {error}")]
    Open { path: PathBuf, error: String },

    #[error("Failed to write audit log: {0}")]
    Write(String),

    #[error("Failed to serialize audit record: {0}")]
    Serialize(String),
}
