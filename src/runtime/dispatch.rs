//! Task pool abstraction and the work dispatcher.
//!
//! The pool is the execution facility connection workers run on. It offers
//! two primitives: submit a job, and wait until a submitted job finishes.
//! The dispatcher is the thin adapter that turns a connection worker into
//! a job and submits it.

use crate::runtime::connection::EchoWorker;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of work accepted by a [`TaskPool`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Execution facility for connection workers.
pub trait TaskPool: Send + Sync {
    /// Submit a job for execution.
    ///
    /// On failure the job is dropped without running.
    fn submit(&self, name: String, job: Job) -> Result<TaskHandle, DispatchError>;
}

/// Handle to a submitted job, used to wait for its completion.
#[derive(Debug)]
pub struct TaskHandle {
    inner: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(inner: JoinHandle<()>) -> Self {
        Self { inner }
    }

    /// True once the job has returned (or panicked).
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Block until the job finishes.
    pub fn wait(self) -> Result<(), TaskPanicked> {
        self.inner.join().map_err(|_| TaskPanicked)
    }
}

/// Pool that runs every job on its own named OS thread.
///
/// With a limit set, submissions beyond `limit` live jobs are refused.
pub struct ThreadPool {
    limit: Option<usize>,
    active: Arc<AtomicUsize>,
}

impl ThreadPool {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of jobs currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn reserve(&self) -> Result<(), DispatchError> {
        let Some(limit) = self.limit else {
            self.active.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };

        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| DispatchError::Exhausted { limit })
    }
}

impl TaskPool for ThreadPool {
    fn submit(&self, name: String, job: Job) -> Result<TaskHandle, DispatchError> {
        self.reserve()?;

        let active = Arc::clone(&self.active);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            // Released even if the job unwinds.
            let _slot = ActiveSlot(active);
            job();
        });

        match spawned {
            Ok(handle) => Ok(TaskHandle::new(handle)),
            Err(e) => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                Err(DispatchError::Spawn(e))
            }
        }
    }
}

struct ActiveSlot(Arc<AtomicUsize>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Submits connection workers to a task pool.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<dyn TaskPool>,
}

impl Dispatcher {
    pub fn new(pool: Arc<dyn TaskPool>) -> Self {
        Self { pool }
    }

    /// Wrap `worker` as a job and submit it.
    pub fn dispatch(&self, worker: EchoWorker) -> Result<TaskHandle, DispatchError> {
        let name = format!("echo-{}", worker.id());
        self.pool.submit(
            name,
            Box::new(move || {
                worker.run();
            }),
        )
    }
}

/// Task submission errors
#[derive(Debug)]
pub enum DispatchError {
    /// The pool is running its maximum number of jobs.
    Exhausted { limit: usize },
    /// The OS refused to start a thread.
    Spawn(io::Error),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Exhausted { limit } => {
                write!(f, "task pool exhausted ({limit} tasks running)")
            }
            DispatchError::Spawn(e) => write!(f, "failed to spawn task: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Spawn(e) => Some(e),
            DispatchError::Exhausted { .. } => None,
        }
    }
}

/// A joined task unwound instead of returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPanicked;

impl fmt::Display for TaskPanicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("task panicked")
    }
}

impl std::error::Error for TaskPanicked {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_submit_and_wait() {
        let pool = ThreadPool::new(None);
        let (tx, rx) = mpsc::channel();

        let handle = pool
            .submit("job".to_string(), Box::new(move || tx.send(7).unwrap()))
            .unwrap();

        handle.wait().unwrap();
        assert_eq!(rx.recv().unwrap(), 7);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_limit_refuses_extra_jobs() {
        let pool = ThreadPool::new(Some(1));
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let first = pool
            .submit(
                "blocked".to_string(),
                Box::new(move || {
                    let _ = release_rx.recv();
                }),
            )
            .unwrap();
        assert_eq!(pool.active(), 1);

        let refused = pool.submit("refused".to_string(), Box::new(|| {}));
        assert!(matches!(refused, Err(DispatchError::Exhausted { limit: 1 })));

        release_tx.send(()).unwrap();
        first.wait().unwrap();
        assert_eq!(pool.active(), 0);

        pool.submit("after".to_string(), Box::new(|| {}))
            .unwrap()
            .wait()
            .unwrap();
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let pool = ThreadPool::new(Some(1));
        let handle = pool
            .submit("boom".to_string(), Box::new(|| panic!("boom")))
            .unwrap();

        assert_eq!(handle.wait(), Err(TaskPanicked));
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_is_finished() {
        let pool = ThreadPool::new(None);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = pool
            .submit(
                "wait".to_string(),
                Box::new(move || {
                    let _ = rx.recv();
                }),
            )
            .unwrap();

        assert!(!handle.is_finished());
        drop(tx);
        for _ in 0..200 {
            if handle.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_finished());
        handle.wait().unwrap();
    }
}
