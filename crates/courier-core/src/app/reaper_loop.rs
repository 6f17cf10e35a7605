//! ReaperLoop - 処理中のまま止まった item の回収
//!
//! プロセス全体の再起動は PersistentQueue の起動時 recovery が面倒を見る。
//! こちらはプロセスが生きたまま個々の送信が hang / kill された場合の回収。

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, warn};

use crate::error::{QueueError, QueueResult};
use crate::queue::PersistentQueue;

/// StuckReaper は Processing に `stuck_after` 以上留まった item を回収する
///
/// # フロー
/// 1. Processing の item を列挙
/// 2. `now - updated_at > stuck_after` なら reclaim（attempts はそのまま）
///    最後の attempt 中だった item は Pending ではなく Failed（dead-letter）になる
/// 3. 列挙と reclaim の間に完了した item はスキップ
///
/// Completed は reclaim の対象にならないので、完了済み item が再送されることはない。
#[derive(Debug, Clone)]
pub struct StuckReaper {
    stuck_after: TimeDelta,
}

impl StuckReaper {
    pub fn new(stuck_after: Duration) -> Self {
        Self {
            stuck_after: TimeDelta::from_std(stuck_after).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Reclaim abandoned items; returns their ids.
    pub fn sweep(&self, queue: &PersistentQueue, now: DateTime<Utc>) -> QueueResult<Vec<String>> {
        let mut reclaimed = Vec::new();
        for item in queue.list_processing() {
            let age = now.signed_duration_since(item.updated_at);
            if age <= self.stuck_after {
                continue;
            }
            match queue.reclaim(&item.id) {
                Ok(item) if item.is_dead_letter() => {
                    error!(
                        id = %item.id,
                        age_secs = age.num_seconds(),
                        attempts = item.attempts,
                        "stuck item had no attempts left, dead-lettered"
                    );
                    reclaimed.push(item.id);
                }
                Ok(item) => {
                    warn!(
                        id = %item.id,
                        age_secs = age.num_seconds(),
                        attempts = item.attempts,
                        "reclaimed stuck item"
                    );
                    reclaimed.push(item.id);
                }
                // finished or removed since we listed it
                Err(QueueError::InvalidTransition { .. } | QueueError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ItemStatus, QueueItem};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn only_old_processing_items_are_reclaimed() {
        let dir = tempdir().unwrap();
        let queue = PersistentQueue::open_dir(dir.path()).unwrap();
        let stuck = queue.add(json!("stuck")).unwrap().id;
        let done = queue.add(json!("done")).unwrap().id;
        let idle = queue.add(json!("idle")).unwrap().id;
        queue.claim(&stuck).unwrap();
        queue.claim(&done).unwrap();
        queue.complete(&done).unwrap();

        let reaper = StuckReaper::new(Duration::from_secs(3600));
        let now = Utc::now();
        assert!(reaper.sweep(&queue, now).unwrap().is_empty());

        let later = now + TimeDelta::hours(2);
        assert_eq!(reaper.sweep(&queue, later).unwrap(), vec![stuck.clone()]);

        let item = queue.get(&stuck).unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 1);
        assert!(queue.get(&done).unwrap().is_completed());
        assert!(queue.get(&idle).unwrap().is_pending());
    }

    #[test]
    fn stuck_item_on_final_attempt_is_dead_lettered() {
        let dir = tempdir().unwrap();
        let queue = PersistentQueue::open_dir(dir.path()).unwrap();
        let id = queue
            .insert(QueueItem::new(json!({})).with_max_attempts(3))
            .unwrap()
            .id;
        for _ in 0..2 {
            queue.claim(&id).unwrap();
            queue.fail(&id, "HTTP 503").unwrap();
            queue.requeue(&id).unwrap();
        }
        queue.claim(&id).unwrap();

        let reaper = StuckReaper::new(Duration::from_secs(60));
        let later = Utc::now() + TimeDelta::hours(1);
        assert_eq!(reaper.sweep(&queue, later).unwrap(), vec![id.clone()]);

        let item = queue.get(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempts, 3);
        assert!(item.is_dead_letter());
        // never handed out for a fourth attempt
        assert!(queue.list_pending().is_empty());
        assert!(queue.claim(&id).is_err());
    }
}
