//! RetryLoop - 失敗した item の再キュー
//!
//! cooldown を過ぎた Failed item を Pending に戻す。
//! retry budget を使い切った item は dead-letter として残し、operator に知らせる。

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::error::{QueueError, QueueResult};
use crate::queue::{PersistentQueue, RetryPolicy};

/// Result of one retry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweep {
    /// Items put back to Pending.
    pub requeued: Vec<String>,

    /// Items seen as dead-lettered for the first time.
    pub dead_letters: Vec<String>,
}

/// RetrySweeper は cooldown を過ぎた Failed item を再キューする
///
/// # ルール
/// - cooldown は `RetryPolicy::next_delay(attempts)`、起点は最後の失敗時刻（`updated_at`）
/// - `can_retry` が false の item は触らない（dead-letter）
/// - dead-letter の報告は item ごとに 1 回だけ
#[derive(Debug)]
pub struct RetrySweeper {
    policy: RetryPolicy,
    reported: Mutex<HashSet<String>>,
}

impl RetrySweeper {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            reported: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn sweep(&self, queue: &PersistentQueue, now: DateTime<Utc>) -> QueueResult<RetrySweep> {
        let mut sweep = RetrySweep::default();
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);

        // forget items that left the dead-letter state (forced retry, removed)
        let dead: HashSet<String> = queue.dead_letters().into_iter().map(|i| i.id).collect();
        reported.retain(|id| dead.contains(id));

        for item in queue.list_failed() {
            if !item.can_retry() {
                if reported.insert(item.id.clone()) {
                    error!(
                        id = %item.id,
                        attempts = item.attempts,
                        last_error = item.last_error.as_deref().unwrap_or(""),
                        "item dead-lettered, manual intervention required"
                    );
                    sweep.dead_letters.push(item.id);
                }
                continue;
            }

            let cooldown = TimeDelta::from_std(self.policy.next_delay(item.attempts))
                .unwrap_or(TimeDelta::MAX);
            if now.signed_duration_since(item.updated_at) < cooldown {
                continue;
            }
            match queue.requeue(&item.id) {
                Ok(item) => {
                    info!(id = %item.id, attempts = item.attempts, "re-queued failed item");
                    sweep.requeued.push(item.id);
                }
                Err(
                    QueueError::InvalidTransition { .. }
                    | QueueError::RetryExhausted { .. }
                    | QueueError::NotFound(_),
                ) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(sweep)
    }
}
