//! RunLoop - submitter の監督ループ
//!
//! poll interval ごとに submit_all_pending → recover_stuck → retry_failed を回す。
//! shutdown は watch channel で伝える（新規 dispatch は即停止、送信中のものは最後まで待つ）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::submitter::{AsyncSubmitter, SubmitterState};
use crate::error::SubmitterError;

/// SubmitterHandle は起動中の run loop への参照
/// - `request_shutdown()` で新規 dispatch を止める
/// - `shutdown_and_join()` で送信中の item が終わるまで（最大 timeout）待つ
#[derive(Debug)]
pub struct SubmitterHandle {
    submitter: Arc<AsyncSubmitter>,
    join: JoinHandle<()>,
}

impl SubmitterHandle {
    pub fn submitter(&self) -> &Arc<AsyncSubmitter> {
        &self.submitter
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request shutdown. In-flight submissions are not cancelled.
    pub fn request_shutdown(&self) {
        self.submitter.request_shutdown();
    }

    /// Shutdown and wait up to `timeout` for the loop to drain.
    ///
    /// Returns false if the timeout elapsed; the loop is then left to finish
    /// in the background rather than aborted mid-upload.
    pub async fn shutdown_and_join(self, timeout: Duration) -> bool {
        self.request_shutdown();
        let mut join = self.join;
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    active_uploads = self.submitter.stats().active_uploads,
                    "submitter did not drain before the stop timeout"
                );
                false
            }
        }
    }

    /// Shutdown using the configured `stop_timeout`.
    pub async fn stop(self) -> bool {
        let timeout = self.submitter.config().stop_timeout();
        self.shutdown_and_join(timeout).await
    }
}

impl AsyncSubmitter {
    /// Start the run loop on the current tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> Result<SubmitterHandle, SubmitterError> {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if matches!(*state, SubmitterState::Running | SubmitterState::Stopping) {
                return Err(SubmitterError::AlreadyRunning);
            }
            *state = SubmitterState::Running;
        }
        self.shutdown.send_replace(false);

        let rx = self.shutdown.subscribe();
        let submitter = Arc::clone(self);
        let join = tokio::spawn(async move {
            run_loop(&submitter, rx).await;
        });
        Ok(SubmitterHandle {
            submitter: Arc::clone(self),
            join,
        })
    }

    /// One pass of the loop body.
    pub async fn run_once(self: &Arc<Self>) {
        match self.submit_all_pending().await {
            Ok(report) if report.breaker_rejected > 0 => {
                warn!(
                    breaker = self.breaker.name(),
                    state = %self.breaker.state(),
                    rejected = report.breaker_rejected,
                    left_pending = self.queue.counts().pending,
                    "circuit breaker refused dispatch"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "submission round aborted"),
        }
        if let Err(e) = self.recover_stuck() {
            error!(error = %e, "stuck item recovery failed");
        }
        if let Err(e) = self.retry_failed() {
            error!(error = %e, "failed item retry sweep failed");
        }
    }
}

async fn run_loop(submitter: &Arc<AsyncSubmitter>, mut shutdown_rx: watch::Receiver<bool>) {
    let config = submitter.config();
    info!(
        max_concurrent = config.max_concurrent,
        poll_interval_ms = config.poll_interval_ms,
        dir = %submitter.queue().dir().display(),
        "submitter started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        submitter.run_once().await;

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval()) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    submitter.set_state(SubmitterState::Stopped);
    let stats = submitter.stats();
    info!(
        total_submitted = stats.total_submitted,
        successful = stats.successful,
        errors = stats.errors,
        "submitter stopped"
    );
}
