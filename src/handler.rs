//! Per-connection protocol handlers run by pool workers.
//!
//! The pool is generic over `ConnectionHandler`. The only production handler
//! is `EchoHandler`: every chunk received is written back verbatim until the
//! peer closes or an I/O error occurs.

use crate::connection::{ConnState, ConnectionRecord, Transport};
use bytes::BytesMut;
use std::io;
use tracing::trace;

/// Default read chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Summary of a connection that ended gracefully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleOutcome {
    /// Total bytes echoed back.
    pub bytes_echoed: u64,
    /// Number of receive/echo round trips.
    pub chunks: u64,
}

/// Services one connection until it reaches `ConnState::Closed`.
///
/// An `Err` is local to the connection: the worker logs it, drops the
/// record and goes back to the queue.
pub trait ConnectionHandler<S>: Send + Sync + 'static {
    fn handle(&self, conn: &mut ConnectionRecord<S>) -> io::Result<HandleOutcome>;
}

/// Echo protocol: read a chunk, write the same chunk back.
#[derive(Debug, Clone)]
pub struct EchoHandler {
    buffer_size: usize,
}

impl EchoHandler {
    /// Create an echo handler reading at most `buffer_size` bytes per receive.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl<S: Transport> ConnectionHandler<S> for EchoHandler {
    fn handle(&self, conn: &mut ConnectionRecord<S>) -> io::Result<HandleOutcome> {
        let mut buffer = BytesMut::zeroed(self.buffer_size);
        let mut outcome = HandleOutcome::default();

        let result = loop {
            let n = match conn.stream.read(&mut buffer[..]) {
                Ok(0) => {
                    trace!(conn = conn.id, peer = %conn.peer, "Connection closed by peer");
                    break Ok(outcome);
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            };

            trace!(conn = conn.id, peer = %conn.peer, bytes = n, "Echoing chunk");

            // write_all retries short writes; a zero-length write is WriteZero.
            if let Err(e) = conn.stream.write_all(&buffer[..n]) {
                break Err(e);
            }
            if let Err(e) = conn.stream.flush() {
                break Err(e);
            }

            outcome.bytes_echoed += n as u64;
            outcome.chunks += 1;
        };

        conn.state = ConnState::Closed;
        result
    }
}
