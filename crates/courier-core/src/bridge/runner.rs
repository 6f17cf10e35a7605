//! Blocking entry point into async code for synchronous callers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::EventLoopPool;
use crate::error::BridgeError;

/// Runs futures to completion from synchronous code (CLI tools, legacy
/// callers) on the calling thread's pooled runtime.
///
/// ```
/// use std::sync::Arc;
/// use courier_core::bridge::{EventLoopPool, SyncRunner};
///
/// let runner = SyncRunner::new(Arc::new(EventLoopPool::new()));
/// assert_eq!(runner.run(async { 40 + 2 }).unwrap(), 42);
/// ```
#[derive(Debug, Clone)]
pub struct SyncRunner {
    pool: Arc<EventLoopPool>,
    default_timeout: Option<Duration>,
}

impl SyncRunner {
    pub fn new(pool: Arc<EventLoopPool>) -> Self {
        Self {
            pool,
            default_timeout: None,
        }
    }

    /// Apply `timeout` to every `run`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn pool(&self) -> &Arc<EventLoopPool> {
        &self.pool
    }

    /// Block until `fut` finishes (or the default timeout, if set, elapses).
    pub fn run<F: Future>(&self, fut: F) -> Result<F::Output, BridgeError> {
        match self.default_timeout {
            Some(timeout) => self.run_with_timeout(fut, timeout),
            None => self.pool.run(fut),
        }
    }

    /// Block until `fut` finishes or `timeout` elapses.
    ///
    /// On timeout the future is dropped.
    pub fn run_with_timeout<F: Future>(
        &self,
        fut: F,
        timeout: Duration,
    ) -> Result<F::Output, BridgeError> {
        // the timer must be created inside the runtime
        self.pool
            .run(async move { tokio::time::timeout(timeout, fut).await })?
            .map_err(|_| BridgeError::TimedOut(timeout))
    }

    /// Release the calling thread's runtime.
    pub fn shutdown(&self) -> bool {
        self.pool.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> SyncRunner {
        SyncRunner::new(Arc::new(EventLoopPool::new()))
    }

    #[test]
    fn run_returns_output() {
        let runner = runner();
        let out = runner
            .run(async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                "done"
            })
            .unwrap();
        assert_eq!(out, "done");
    }

    #[test]
    fn errors_from_the_future_are_passed_through() {
        let runner = runner();
        let out: Result<Result<(), String>, _> = runner.run(async { Err("boom".to_string()) });
        assert_eq!(out.unwrap(), Err("boom".to_string()));
    }

    #[test]
    fn run_with_timeout_gives_up() {
        let runner = runner();
        let res = runner.run_with_timeout(
            async { tokio::time::sleep(Duration::from_secs(10)).await },
            Duration::from_millis(20),
        );
        assert!(matches!(res, Err(BridgeError::TimedOut(_))));

        let runner = runner.with_default_timeout(Duration::from_millis(20));
        assert!(runner.run(std::future::pending::<()>()).is_err());
    }

    #[test]
    fn shutdown_through_runner() {
        let runner = runner();
        runner.run(async {}).unwrap();
        assert_eq!(runner.pool().active_threads(), 1);
        assert!(runner.shutdown());
        assert_eq!(runner.pool().active_threads(), 0);
    }
}
