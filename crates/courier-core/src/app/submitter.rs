//! AsyncSubmitter - bounded concurrent uploader.
//!
//! Pulls Pending items from the [`PersistentQueue`], gates each remote call
//! through the [`RateLimiter`] and the [`CircuitBreaker`], and records the
//! outcome on the item.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::reaper_loop::StuckReaper;
use super::retry_loop::{RetrySweep, RetrySweeper};
use crate::config::SubmitterConfig;
use crate::domain::ErrorKind;
use crate::error::{QueueError, SubmitterError};
use crate::observability::SubmitterStats;
use crate::ports::{Clock, RemoteSubmitter};
use crate::queue::PersistentQueue;
use crate::resilience::{CircuitBreaker, RateLimiter};

/// Lifecycle of a submitter.
///
/// State transitions:
/// - Created -> Running (`spawn`)
/// - Running -> Stopping (shutdown requested, in-flight work draining)
/// - Stopping -> Stopped (run loop exited)
/// - Stopped -> Running (`spawn` again)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitterState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The remote accepted it.
    Completed,

    /// The remote rejected it; `retryable` is false for a dead letter.
    Failed { retryable: bool },

    /// No rate-limit slot in time. The item is still Pending and no attempt
    /// was used.
    Deferred,

    /// The item was not Pending any more (claimed elsewhere, completed,
    /// removed).
    Skipped,
}

/// Tally of one `submit_all_pending` round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    pub skipped: usize,
    /// Items left Pending because the breaker was open.
    pub breaker_rejected: usize,
    /// Tasks that panicked; their items are left for the reaper.
    pub crashed: usize,
}

/// Decrements `active_uploads` however the submission ends.
struct ActiveUpload<'a> {
    stats: &'a Mutex<SubmitterStats>,
}

impl<'a> ActiveUpload<'a> {
    fn start(stats: &'a Mutex<SubmitterStats>) -> Self {
        let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
        s.active_uploads += 1;
        s.total_submitted += 1;
        Self { stats }
    }
}

impl Drop for ActiveUpload<'_> {
    fn drop(&mut self) {
        let mut s = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        s.active_uploads = s.active_uploads.saturating_sub(1);
    }
}

/// Drains Pending items to the remote collector with bounded parallelism.
///
/// Design:
/// - At most `max_concurrent` remote calls are in flight, whether they come
///   from `submit_all_pending`, `submit_one` or both.
/// - Gates run before the claim, breaker first: a breaker-rejected item uses
///   no rate-limit token, and a rate-limited or breaker-rejected item stays
///   Pending and keeps its attempt budget.
/// - `PersistentQueue::claim` is atomic, so an item is never sent twice at
///   the same time, and a Completed item is never claimed again.
/// - Storage failures abort the operation and propagate. Delivery failures
///   are recorded on the item and do not.
///
/// Build one with [`SubmitterBuilder`](super::SubmitterBuilder).
pub struct AsyncSubmitter {
    pub(super) queue: Arc<PersistentQueue>,
    pub(super) remote: Arc<dyn RemoteSubmitter>,
    pub(super) breaker: Arc<CircuitBreaker>,
    pub(super) limiter: Arc<RateLimiter>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: SubmitterConfig,
    pub(super) semaphore: Arc<Semaphore>,
    pub(super) reaper: StuckReaper,
    pub(super) sweeper: RetrySweeper,
    pub(super) state: Mutex<SubmitterState>,
    pub(super) stats: Mutex<SubmitterStats>,
    pub(super) shutdown: watch::Sender<bool>,
}

impl fmt::Debug for AsyncSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSubmitter")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AsyncSubmitter {
    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.queue
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    pub fn state(&self) -> SubmitterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn set_state(&self, state: SubmitterState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn stats_mut(&self) -> MutexGuard<'_, SubmitterStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> SubmitterStats {
        *self.stats_mut()
    }

    /// Has a shutdown been requested?
    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop dispatching new work. In-flight submissions finish normally.
    pub fn request_shutdown(&self) {
        // ignore send error: there may be no receivers
        let _ = self.shutdown.send(true);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SubmitterState::Running {
            *state = SubmitterState::Stopping;
        }
    }

    /// Submit one item, waiting for a concurrency slot first.
    pub async fn submit_one(&self, id: &str) -> Result<SubmitOutcome, SubmitterError> {
        let Ok(_slot) = self.semaphore.acquire().await else {
            return Ok(SubmitOutcome::Skipped);
        };
        self.deliver(id).await
    }

    /// Gates, claim, remote call, bookkeeping. The caller holds a slot.
    async fn deliver(&self, id: &str) -> Result<SubmitOutcome, SubmitterError> {
        let Some(permit) = self.breaker.acquire() else {
            self.stats_mut().breaker_rejections += 1;
            debug!(id, state = %self.breaker.state(), "breaker refused dispatch, item stays pending");
            return Err(SubmitterError::BreakerOpen {
                name: self.breaker.name().to_string(),
            });
        };

        // an unused permit is released on drop without a verdict
        if !self
            .limiter
            .acquire(&self.config.rate_limit_key, self.config.acquire_timeout())
            .await
        {
            self.stats_mut().deferred += 1;
            debug!(id, "rate limited, item stays pending");
            return Ok(SubmitOutcome::Deferred);
        }

        let item = match self.queue.claim(id) {
            Ok(item) => item,
            Err(QueueError::InvalidTransition { .. } | QueueError::NotFound(_)) => {
                return Ok(SubmitOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        debug!(id, attempt = item.attempts, probe = permit.is_probe(), "submitting item");

        let result = {
            let _active = ActiveUpload::start(&self.stats);
            self.remote.submit(&item.data).await
        };

        match result {
            Ok(()) => {
                permit.record_success();
                self.stats_mut().successful += 1;
                match self.queue.complete(id) {
                    Ok(_) => {
                        debug!(id, "item delivered");
                        Ok(SubmitOutcome::Completed)
                    }
                    Err(QueueError::InvalidTransition { from, .. }) => {
                        // reclaimed as stuck while we were sending
                        warn!(id, status = %from, "delivered item was reclaimed meanwhile; it may be sent again");
                        Ok(SubmitOutcome::Completed)
                    }
                    Err(QueueError::NotFound(_)) => Ok(SubmitOutcome::Completed),
                    Err(e) => {
                        error!(id, error = %e, "delivered item could not be marked completed");
                        Err(e.into())
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::BreakerOpen => {
                // the remote refused without trying; not the item's fault
                permit.record_ignored();
                self.stats_mut().breaker_rejections += 1;
                match self.queue.reclaim(id) {
                    Ok(_) | Err(QueueError::InvalidTransition { .. } | QueueError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                Err(SubmitterError::BreakerOpen {
                    name: self.breaker.name().to_string(),
                })
            }
            Err(e) => {
                if e.kind().counts_as_failure() {
                    permit.record_failure();
                } else {
                    permit.record_ignored();
                }
                self.stats_mut().errors += 1;

                let item = match self.queue.fail(id, e.message()) {
                    Ok(item) => item,
                    Err(QueueError::InvalidTransition { .. } | QueueError::NotFound(_)) => {
                        warn!(id, error = %e, "failed item was reclaimed meanwhile");
                        return Ok(SubmitOutcome::Failed { retryable: true });
                    }
                    Err(qe) => {
                        error!(id, error = %qe, "failed item could not be recorded");
                        return Err(qe.into());
                    }
                };

                let retryable = item.can_retry();
                if retryable {
                    warn!(
                        id,
                        kind = %e.kind(),
                        attempts = item.attempts,
                        max_attempts = item.max_attempts,
                        error = e.message(),
                        "submission failed, will retry"
                    );
                } else {
                    error!(
                        id,
                        kind = %e.kind(),
                        attempts = item.attempts,
                        error = e.message(),
                        "submission failed, retries exhausted"
                    );
                }
                Ok(SubmitOutcome::Failed { retryable })
            }
        }
    }

    /// Submit every Pending item, highest priority first, at most
    /// `max_concurrent` at a time.
    ///
    /// Dispatch stops early on shutdown, when the breaker opens, or on a
    /// storage failure; items not dispatched stay Pending. In-flight work is
    /// always drained before this returns.
    pub async fn submit_all_pending(self: &Arc<Self>) -> Result<BatchReport, SubmitterError> {
        let mut report = BatchReport::default();
        let mut storage_error: Option<QueueError> = None;
        let mut tasks: JoinSet<Result<SubmitOutcome, SubmitterError>> = JoinSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();

        for item in self.queue.list_pending() {
            if *shutdown_rx.borrow() || self.breaker.is_open() {
                break;
            }
            let slot = tokio::select! {
                slot = Arc::clone(&self.semaphore).acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            while let Some(joined) = tasks.try_join_next() {
                tally(&mut report, &mut storage_error, joined);
            }
            // the breaker may have opened while we waited for the slot
            if storage_error.is_some() || report.breaker_rejected > 0 || self.breaker.is_open() {
                break;
            }

            let this = Arc::clone(self);
            report.dispatched += 1;
            tasks.spawn(async move {
                let _slot = slot;
                this.deliver(&item.id).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            tally(&mut report, &mut storage_error, joined);
        }

        if let Some(e) = storage_error {
            return Err(e.into());
        }
        if report.dispatched > 0 {
            info!(
                dispatched = report.dispatched,
                completed = report.completed,
                failed = report.failed,
                deferred = report.deferred,
                breaker_rejected = report.breaker_rejected,
                "submission round finished"
            );
        }
        Ok(report)
    }

    /// Put items stuck in Processing longer than `stuck_after` back to
    /// Pending. Returns how many were reclaimed.
    pub fn recover_stuck(&self) -> Result<usize, SubmitterError> {
        let reclaimed = self.reaper.sweep(&self.queue, self.clock.now())?;
        Ok(reclaimed.len())
    }

    /// Re-queue Failed items whose cooldown has passed and surface new dead
    /// letters.
    pub fn retry_failed(&self) -> Result<RetrySweep, SubmitterError> {
        Ok(self.sweeper.sweep(&self.queue, self.clock.now())?)
    }
}

fn tally(
    report: &mut BatchReport,
    storage_error: &mut Option<QueueError>,
    joined: Result<Result<SubmitOutcome, SubmitterError>, JoinError>,
) {
    match joined {
        Ok(Ok(SubmitOutcome::Completed)) => report.completed += 1,
        Ok(Ok(SubmitOutcome::Failed { retryable })) => {
            report.failed += 1;
            if !retryable {
                report.dead_lettered += 1;
            }
        }
        Ok(Ok(SubmitOutcome::Deferred)) => report.deferred += 1,
        Ok(Ok(SubmitOutcome::Skipped)) => report.skipped += 1,
        Ok(Err(SubmitterError::BreakerOpen { .. })) => report.breaker_rejected += 1,
        Ok(Err(SubmitterError::Queue(e))) => {
            if storage_error.is_none() {
                *storage_error = Some(e);
            }
        }
        Ok(Err(SubmitterError::AlreadyRunning)) => {}
        Err(e) => {
            error!(error = %e, "submission task crashed");
            report.crashed += 1;
        }
    }
}
