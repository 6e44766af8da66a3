//! Connection lifecycle tracking.
//!
//! A connection ends in one of two ways that the upload pipeline cares
//! about:
//! - **aborted**: the client went away (EOF before the declared body length,
//!   reset, or stalled past the read timeout) before a response was produced.
//!   The [`AbortSignal`] is tripped and no response may be written.
//! - **closed**: the connection is done, whatever the reason. Logged when the
//!   [`ConnectionMonitor`] drops.
//!
//! The request body is wrapped in a [`MonitoredBody`], so the abort is
//! detected on the same read that the streaming writer is blocked on and the
//! writer can check the signal between chunks.

use log::{debug, warn};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Cooperative cancellation flag shared between the body reader, the writer
/// and the connection handler.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Returns `true` only for the call that tripped it.
    pub fn abort(&self) -> bool {
        !self.aborted.swap(true, Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Per-connection observer. Owns the abort signal handed to the request and
/// reports the close event when dropped.
pub struct ConnectionMonitor {
    peer: SocketAddr,
    signal: AbortSignal,
    opened_at: Instant,
}

impl ConnectionMonitor {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            signal: AbortSignal::new(),
            opened_at: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        if self.signal.is_aborted() {
            warn!(
                "[{}] Connection closed after client abort ({}ms)",
                self.peer,
                self.opened_at.elapsed().as_millis()
            );
        } else {
            debug!(
                "[{}] Connection closed ({}ms)",
                self.peer,
                self.opened_at.elapsed().as_millis()
            );
        }
    }
}

/// A `Content-Length` framed request body that trips the [`AbortSignal`]
/// when the client disappears before sending every declared byte.
pub struct MonitoredBody<R> {
    inner: R,
    remaining: u64,
    signal: AbortSignal,
}

impl<R: Read> MonitoredBody<R> {
    pub fn new(inner: R, content_length: u64, signal: AbortSignal) -> Self {
        Self {
            inner,
            remaining: content_length,
            signal,
        }
    }

    /// Declared body bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Read and discard up to `limit` unread body bytes. Returns `true` when
    /// the body was consumed completely.
    pub fn drain(&mut self, limit: u64) -> bool {
        if self.signal.is_aborted() {
            return false;
        }
        let mut budget = limit;
        let mut scratch = [0u8; 8192];
        while self.remaining > 0 && budget > 0 {
            let want = scratch.len().min(usize::try_from(budget).unwrap_or(usize::MAX));
            match self.read(&mut scratch[..want]) {
                Ok(n) => budget = budget.saturating_sub(n as u64),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
        self.remaining == 0
    }

    fn aborted_error(reason: &str) -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, reason.to_string())
    }
}

impl<R: Read> Read for MonitoredBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.signal.is_aborted() {
            return Err(Self::aborted_error("connection already aborted"));
        }
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let max = buf
            .len()
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        match self.inner.read(&mut buf[..max]) {
            Ok(0) => {
                self.signal.abort();
                Err(Self::aborted_error(
                    "client closed the connection before the body was complete",
                ))
            }
            Ok(n) => {
                self.remaining -= n as u64;
                Ok(n)
            }
            Err(e) if is_disconnect(&e) => {
                self.signal.abort();
                Err(Self::aborted_error(&format!("client connection lost: {e}")))
            }
            Err(e) => Err(e),
        }
    }
}

/// Errors that mean the peer is gone (or stalled past the read timeout)
/// rather than a local fault.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}
