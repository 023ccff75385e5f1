//! Connection runtime for the echo service.
//!
//! Blocking, thread-per-connection model:
//! - `EchoWorker`: per-connection read/echo loop
//! - `WorkerRegistry`: every live worker, reachable for shutdown
//! - `Dispatcher`: submits workers to a `TaskPool`

mod connection;
mod dispatch;
mod registry;

pub(crate) use connection::{shutdown_stream, EchoWorker, DEFAULT_BUFFER_SIZE};
pub(crate) use dispatch::{Dispatcher, TaskPool, ThreadPool};
pub(crate) use registry::WorkerRegistry;

#[cfg(test)]
pub(crate) use dispatch::{DispatchError, Job, TaskHandle};
