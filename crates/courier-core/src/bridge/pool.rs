//! One tokio runtime per calling OS thread.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::error::BridgeError;

/// Pool of single-threaded runtimes keyed by the calling thread.
///
/// Design:
/// - A thread gets its runtime on its first `run` and keeps it until
///   `shutdown` (or `shutdown_all`). Tasks spawned during one `run` keep
///   living on that runtime and make progress during the next one.
/// - Two threads never share a runtime.
/// - `run` refuses to block from inside a tokio runtime instead of
///   deadlocking or panicking.
///
/// Runtimes of threads that exited without calling `shutdown` stay in the
/// pool until `shutdown_all`.
#[derive(Debug, Default)]
pub struct EventLoopPool {
    runtimes: Mutex<HashMap<ThreadId, Arc<Runtime>>>,
}

impl EventLoopPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<Runtime>>> {
        self.runtimes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current thread's runtime, created on first use.
    pub(crate) fn runtime_for_current_thread(&self) -> Result<Arc<Runtime>, BridgeError> {
        let id = thread::current().id();
        let mut runtimes = self.lock();
        if let Some(rt) = runtimes.get(&id) {
            return Ok(Arc::clone(rt));
        }
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(BridgeError::Build)?;
        debug!(thread = ?id, "created runtime for thread");
        let rt = Arc::new(rt);
        runtimes.insert(id, Arc::clone(&rt));
        Ok(rt)
    }

    /// Drive `fut` to completion on this thread's runtime.
    pub fn run<F: Future>(&self, fut: F) -> Result<F::Output, BridgeError> {
        if Handle::try_current().is_ok() {
            return Err(BridgeError::NestedRuntime);
        }
        let rt = self.runtime_for_current_thread()?;
        Ok(rt.block_on(fut))
    }

    /// Does the current thread own a runtime?
    pub fn has_runtime(&self) -> bool {
        self.lock().contains_key(&thread::current().id())
    }

    /// Stop and release the current thread's runtime.
    pub fn shutdown(&self) -> bool {
        let removed = self.lock().remove(&thread::current().id());
        match removed {
            Some(rt) => {
                release(rt);
                true
            }
            None => false,
        }
    }

    /// Stop every runtime in the pool. Returns how many were released.
    pub fn shutdown_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().map(|(_, rt)| rt).collect();
        let count = drained.len();
        drained.into_iter().for_each(release);
        count
    }

    pub fn active_threads(&self) -> usize {
        self.lock().len()
    }
}

fn release(rt: Arc<Runtime>) {
    // a runtime still inside block_on on its own thread is dropped there
    if let Ok(rt) = Arc::try_unwrap(rt) {
        rt.shutdown_background();
    }
}
