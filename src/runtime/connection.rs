//! Per-connection echo worker.
//!
//! A worker owns one accepted socket (shared with its registry entry) and
//! one read buffer. It alternates between reading a request and writing
//! back the same bytes until the peer closes, an I/O error occurs, or the
//! service stop flag is observed between cycles.
//!
//! The stop flag alone never interrupts a blocked read. The shutdown
//! coordinator shuts the socket down to wake it.

use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Default number of bytes read per receive call.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Current state of a connection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed, not yet running.
    Created,
    /// Blocked in (or about to enter) a receive.
    Reading,
    /// Echoing `len` received bytes back.
    Writing { len: usize },
    /// Socket is being shut down.
    Closing,
    /// Worker has returned.
    Terminated,
}

/// Why a worker left its echo loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side (zero-length read).
    PeerClosed,
    /// The service stop flag was set between cycles.
    Stopped,
    ReadError,
    WriteError,
}

/// Shut down both directions of `stream`.
///
/// Shutting down an already shut down or reset socket is not an error.
pub fn shutdown_stream(stream: &TcpStream) -> io::Result<()> {
    match stream.shutdown(Shutdown::Both) {
        Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
        _ => Ok(()),
    }
}

/// Echo loop for a single accepted connection.
pub struct EchoWorker {
    id: usize,
    stream: Arc<TcpStream>,
    peer: SocketAddr,
    stopped: Arc<AtomicBool>,
    buffer_size: usize,
    state: ConnState,
}

impl EchoWorker {
    pub fn new(
        id: usize,
        stream: Arc<TcpStream>,
        peer: SocketAddr,
        stopped: Arc<AtomicBool>,
        buffer_size: usize,
    ) -> Self {
        Self {
            id,
            stream,
            peer,
            stopped,
            buffer_size,
            state: ConnState::Created,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Run the echo loop to completion.
    ///
    /// Shuts the socket down on exit but does not release it; the handle
    /// is released by whoever owns the registry entry.
    pub fn run(mut self) -> CloseReason {
        let mut buffer = BytesMut::zeroed(self.buffer_size);

        let reason = match self.echo_loop(&mut buffer) {
            Ok(reason) => reason,
            Err(e) => match self.state {
                ConnState::Writing { len } => {
                    error!(worker = self.id, peer = %self.peer, len, error = %e, "Send failed");
                    CloseReason::WriteError
                }
                _ => {
                    error!(worker = self.id, peer = %self.peer, error = %e, "Receive failed");
                    CloseReason::ReadError
                }
            },
        };

        self.state = ConnState::Closing;
        if let Err(e) = shutdown_stream(&self.stream) {
            debug!(worker = self.id, error = %e, "Socket shutdown failed");
        }
        drop(buffer);

        self.state = ConnState::Terminated;
        debug!(worker = self.id, peer = %self.peer, reason = ?reason, "Worker finished");
        reason
    }

    fn echo_loop(&mut self, buffer: &mut [u8]) -> io::Result<CloseReason> {
        let stream = Arc::clone(&self.stream);
        let mut stream: &TcpStream = &stream;

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(CloseReason::Stopped);
            }

            self.state = ConnState::Reading;
            let len = match stream.read(buffer) {
                Ok(0) => {
                    trace!(worker = self.id, "Connection closed by peer");
                    return Ok(CloseReason::PeerClosed);
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            self.state = ConnState::Writing { len };
            trace!(worker = self.id, len, "Echoing request");
            stream.write_all(&buffer[..len])?;
        }
    }
}
