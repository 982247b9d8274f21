//! Accepting connections for the HTTP server.
//!
//! [`ConnectionListener`] feeds `axum::serve`. Transient accept errors are
//! logged and retried after a short pause. Any other accept error is fatal:
//! it is recorded, the shutdown token is cancelled, and the listener stops
//! producing connections.
//!
//! Every accepted socket is wrapped in a [`TrackedStream`], which bounds each
//! stalled write by the write timeout and holds a [`TaskTracker`] token for
//! as long as the connection is open.

use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::serve::Listener;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Pause after a transient accept failure.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// `ENFILE` and `EMFILE` on Linux.
const FD_EXHAUSTED: [i32; 2] = [23, 24];

/// TCP listener handed to `axum::serve`.
#[derive(Debug)]
pub struct ConnectionListener {
    inner: TcpListener,
    write_timeout: Duration,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    failure: Arc<OnceLock<String>>,

    /// Connection counter for log correlation
    accepted: u64,
}

impl ConnectionListener {
    pub fn new(
        inner: TcpListener,
        write_timeout: Duration,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner,
            write_timeout,
            tracker,
            shutdown,
            failure: Arc::new(OnceLock::new()),
            accepted: 0,
        }
    }

    /// Set once a fatal accept error has stopped the listener.
    pub fn failure(&self) -> Arc<OnceLock<String>> {
        Arc::clone(&self.failure)
    }
}

impl Listener for ConnectionListener {
    type Io = TrackedStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    self.accepted += 1;
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(connection = self.accepted, error = %e, "Failed to set TCP_NODELAY");
                    }
                    debug!(connection = self.accepted, peer = %peer, "Accepted connection");

                    let stream = TrackedStream::new(stream, self.write_timeout, self.tracker.token());
                    return (stream, peer);
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                    sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    error!(error = %e, "Accept failed, shutting down");
                    let _ = self.failure.set(e.to_string());
                    self.shutdown.cancel();
                    return future::pending().await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// Accept errors that affect one connection, not the listener.
fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || error
        .raw_os_error()
        .is_some_and(|code| FD_EXHAUSTED.contains(&code))
}

/// An accepted connection.
///
/// A write or flush that stays pending for longer than the write timeout
/// fails with [`io::ErrorKind::TimedOut`], which makes the HTTP layer drop
/// the connection.
#[derive(Debug)]
pub struct TrackedStream<S> {
    inner: S,
    write_timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
    _token: TaskTrackerToken,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, write_timeout: Duration, token: TaskTrackerToken) -> Self {
        Self {
            inner,
            write_timeout,
            deadline: None,
            _token: token,
        }
    }

    fn bound<T>(&mut self, cx: &mut Context<'_>, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if poll.is_ready() {
            self.deadline = None;
            return poll;
        }

        let write_timeout = self.write_timeout;
        let deadline = self
            .deadline
            .get_or_insert_with(|| Box::pin(sleep(write_timeout)));
        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.deadline = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write timed out",
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.bound(cx, poll)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.bound(cx, poll)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.bound(cx, poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.bound(cx, poll)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let tracker = TaskTracker::new();
        let (server, _client) = duplex(8);
        let mut stream = TrackedStream::new(server, Duration::from_secs(5), tracker.token());

        // The peer never reads, so the second half never fits
        let err = stream.write_all(&[0u8; 16]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progressing_writes_do_not_time_out() {
        let tracker = TaskTracker::new();
        let (server, mut client) = duplex(8);
        let mut stream = TrackedStream::new(server, Duration::from_secs(5), tracker.token());

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut chunk = [0u8; 8];
            while received.len() < 64 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let n = client.read(&mut chunk).await.unwrap();
                received.extend_from_slice(&chunk[..n]);
            }
            received
        });

        stream.write_all(&[7u8; 64]).await.unwrap();
        assert_eq!(reader.await.unwrap(), vec![7u8; 64]);
    }

    #[tokio::test]
    async fn test_open_streams_are_tracked() {
        let tracker = TaskTracker::new();
        let (server, _client) = duplex(8);

        let stream = TrackedStream::new(server, Duration::from_secs(5), tracker.token());
        assert_eq!(tracker.len(), 1);

        drop(stream);
        assert!(tracker.is_empty());
    }
}
