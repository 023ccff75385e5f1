//! TCP echo service.
//!
//! A single acceptor loop hands every accepted connection to a worker on
//! the task pool and records it in the registry. When stop is requested
//! the loop exits and the shutdown coordinator drains the registry: each
//! socket is shut down (waking blocked reads), its task joined, and only
//! then the socket released.

use crate::runtime::{shutdown_stream, Dispatcher, EchoWorker, TaskPool, WorkerRegistry};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long `StopSignal::request` waits for its wake-up connection.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// External "should stop" signal polled by the acceptor.
///
/// A blocking accept does not observe the flag on its own, so `request`
/// also opens a throwaway connection to the listener to make the pending
/// accept return.
#[derive(Debug, Clone)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
    wake_addr: SocketAddr,
}

impl StopSignal {
    /// Signal that wakes the acceptor blocked on `listener`.
    pub fn for_listener(listener: &TcpListener) -> io::Result<Self> {
        let mut addr = listener.local_addr()?;
        if addr.ip().is_unspecified() {
            let loopback = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }

        Ok(Self {
            requested: Arc::new(AtomicBool::new(false)),
            wake_addr: addr,
        })
    }

    pub fn request(&self) {
        if self.requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT) {
            debug!(addr = %self.wake_addr, error = %e, "Acceptor wake-up connect failed");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Outcome of draining the registry at shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Registry entries shut down, joined, and released.
    pub drained: usize,
    /// Drained tasks that had panicked.
    pub panicked: usize,
}

/// Service context shared by the acceptor, the workers, and shutdown.
pub struct EchoService {
    stopped: Arc<AtomicBool>,
    registry: WorkerRegistry,
    dispatcher: Dispatcher,
    buffer_size: usize,
}

impl EchoService {
    pub fn new(pool: Arc<dyn TaskPool>, buffer_size: usize) -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            registry: WorkerRegistry::new(),
            dispatcher: Dispatcher::new(pool),
            buffer_size,
        }
    }

    /// True once shutdown has begun. Never reverts.
    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of workers currently registered.
    #[cfg(test)]
    pub fn registered(&self) -> usize {
        self.registry.len()
    }

    /// Run the accept loop until `stop` is requested, then shut down.
    ///
    /// Blocks for the lifetime of the service.
    pub fn start(&self, listener: &TcpListener, stop: &StopSignal) -> ShutdownReport {
        match listener.local_addr() {
            Ok(addr) => info!(address = %addr, "Accepting connections"),
            Err(e) => warn!(error = %e, "Listener has no local address"),
        }

        while !stop.is_requested() {
            let (stream, peer) = match listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    if stop.is_requested() {
                        break;
                    }
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            if stop.is_requested() {
                // Wake-up connection, or a client that raced the stop.
                let _ = shutdown_stream(&stream);
                break;
            }

            let reaped = self.registry.reap();
            if reaped > 0 {
                debug!(reaped, "Released finished workers");
            }
            self.spawn_worker(stream, peer);
        }

        info!("Daemon shutdown in progress");
        self.shutdown()
    }

    /// Register `stream` and submit its worker.
    ///
    /// On failure the socket is shut down and released right here.
    fn spawn_worker(&self, stream: TcpStream, peer: SocketAddr) {
        let stream = Arc::new(stream);
        let worker_stream = Arc::clone(&stream);
        let stopped = Arc::clone(&self.stopped);

        let registered = self.registry.register(Arc::clone(&stream), peer, |id| {
            self.dispatcher.dispatch(EchoWorker::new(
                id,
                worker_stream,
                peer,
                stopped,
                self.buffer_size,
            ))
        });

        match registered {
            Ok(id) => debug!(worker = id, peer = %peer, "New connection"),
            Err(e) => {
                error!(peer = %peer, error = %e, "Create worker failed, connection closed");
                if let Err(e) = shutdown_stream(&stream) {
                    debug!(peer = %peer, error = %e, "Socket shutdown failed");
                }
            }
        }
    }

    /// Set the stop flag, then drain every registered worker.
    ///
    /// Runs once; later calls return an empty report.
    fn shutdown(&self) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }

        let mut report = ShutdownReport::default();
        for (id, worker) in self.registry.close() {
            if worker.drain(id).is_err() {
                warn!(worker = id, "Worker task panicked");
                report.panicked += 1;
            }
            report.drained += 1;
        }
        debug_assert!(self.registry.is_empty());

        info!(
            drained = report.drained,
            panicked = report.panicked,
            "Echo service stopped"
        );
        report
    }
}

/// Create the blocking listening socket.
pub fn bind_listener(listen: &str, backlog: i32) -> io::Result<TcpListener> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
