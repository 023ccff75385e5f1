//! Registry of live connection workers.
//!
//! Every dispatched worker has an entry here holding its socket and the
//! handle of its task, so shutdown can reach all of them. Entries use slab
//! allocation; the slab key doubles as the worker id.

use crate::runtime::connection::shutdown_stream;
use crate::runtime::dispatch::{DispatchError, TaskHandle, TaskPanicked};
use slab::Slab;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Registry entry for one dispatched worker.
#[derive(Debug)]
pub struct Worker {
    stream: Arc<TcpStream>,
    peer: SocketAddr,
    task: TaskHandle,
}

impl Worker {
    /// Shut the socket down, wait for the task, then release the socket.
    ///
    /// The order matters: joining first could block forever on an idle
    /// peer, and releasing before the join would pull the socket out from
    /// under a running task.
    pub fn drain(self, id: usize) -> Result<(), TaskPanicked> {
        let Worker { stream, peer, task } = self;

        if let Err(e) = shutdown_stream(&stream) {
            warn!(worker = id, error = %e, "Socket shutdown failed");
        }
        let joined = task.wait();

        debug_assert_eq!(Arc::strong_count(&stream), 1);
        drop(stream);
        debug!(worker = id, peer = %peer, "Socket released");
        joined
    }
}

struct Inner {
    workers: Slab<Worker>,
    closed: bool,
}

/// Mutex-protected set of live workers.
pub struct WorkerRegistry {
    inner: Mutex<Inner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                workers: Slab::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries are only linked after a successful spawn, so the data is
        // consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a connection and submit its task in one step.
    ///
    /// `spawn` receives the worker id and must submit the task. The entry
    /// is linked only if it succeeds, so no reader ever sees an entry
    /// without a task handle. Fails with [`RegisterError::Closed`] once
    /// the registry has been drained.
    pub fn register<F>(
        &self,
        stream: Arc<TcpStream>,
        peer: SocketAddr,
        spawn: F,
    ) -> Result<usize, RegisterError>
    where
        F: FnOnce(usize) -> Result<TaskHandle, DispatchError>,
    {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RegisterError::Closed);
        }

        let entry = inner.workers.vacant_entry();
        let id = entry.key();
        let task = spawn(id).map_err(RegisterError::Dispatch)?;
        entry.insert(Worker { stream, peer, task });
        Ok(id)
    }

    /// Release entries whose tasks have already finished.
    ///
    /// Returns the number of entries removed.
    pub fn reap(&self) -> usize {
        let finished: Vec<(usize, Worker)> = {
            let mut inner = self.lock();
            let ids: Vec<usize> = inner
                .workers
                .iter()
                .filter(|(_, w)| w.task.is_finished())
                .map(|(id, _)| id)
                .collect();
            ids.into_iter()
                .map(|id| (id, inner.workers.remove(id)))
                .collect()
        };

        let count = finished.len();
        for (id, worker) in finished {
            if worker.drain(id).is_err() {
                warn!(worker = id, "Worker task panicked");
            }
        }
        count
    }

    /// Close the registry and take every remaining entry.
    ///
    /// Later registrations fail; the caller owns the returned workers.
    pub fn close(&self) -> Vec<(usize, Worker)> {
        let mut inner = self.lock();
        inner.closed = true;
        std::mem::take(&mut inner.workers).into_iter().collect()
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration errors
#[derive(Debug)]
pub enum RegisterError {
    /// The registry was closed by shutdown.
    Closed,
    /// Task submission failed.
    Dispatch(DispatchError),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::Closed => f.write_str("registry closed for shutdown"),
            RegisterError::Dispatch(e) => write!(f, "dispatch failed: {e}"),
        }
    }
}

impl std::error::Error for RegisterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegisterError::Dispatch(e) => Some(e),
            RegisterError::Closed => None,
        }
    }
}
