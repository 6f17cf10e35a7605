//! Directory-backed persistent queue.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::layout::{DirLayout, ErrorInfo, ScannedItem, remove_if_exists};
use super::{ItemStatus, QueueItem};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::observability::QueueCounts;

/// Stored item plus its insertion sequence (FIFO tie-break).
#[derive(Debug)]
struct Slot {
    item: QueueItem,
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<String, Slot>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, item: QueueItem) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(item.id.clone(), Slot { item, seq });
    }

    fn sorted(&self, status: Option<ItemStatus>) -> Vec<QueueItem> {
        let mut slots: Vec<&Slot> = self
            .slots
            .values()
            .filter(|s| status.is_none_or(|st| s.item.status == st))
            .collect();
        slots.sort_by(|a, b| a.item.cmp_dispatch(&b.item).then(a.seq.cmp(&b.seq)));
        slots.into_iter().map(|s| s.item.clone()).collect()
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for slot in self.slots.values() {
            counts.record(slot.item.status);
        }
        counts
    }
}

/// What a directory scan found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Items now held in memory.
    pub loaded: usize,

    /// Items found mid-flight: back to Pending, or dead-lettered if that
    /// was their last attempt.
    pub recovered: usize,

    /// Unreadable files left on disk untouched.
    pub skipped: usize,

    /// Stale artifacts removed because the same id had a more advanced state.
    pub duplicates: usize,
}

/// Durable queue of [`QueueItem`]s, one file per item.
///
/// Design:
/// - Disk first: every mutation is written (and fsynced) before the in-memory
///   copy changes. If the write fails the caller gets the error and the queue
///   is exactly as it was.
/// - All state sits behind one mutex, so `add`/`update`/`claim` may be called
///   from any thread or task without external locking.
/// - The status of an item is the suffix of its file. On open, anything left
///   in Processing by a dead process goes back to Pending, or to Failed if it
///   was on its last attempt.
///
/// ```no_run
/// use courier_core::{PersistentQueue, QueueConfig};
///
/// let queue = PersistentQueue::open(QueueConfig::new("./queue"))?;
/// let item = queue.add(serde_json::json!({ "serial": "SN-1" }))?;
/// assert!(queue.get(&item.id).is_some());
/// # Ok::<(), courier_core::QueueError>(())
/// ```
#[derive(Debug)]
pub struct PersistentQueue {
    layout: DirLayout,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl PersistentQueue {
    /// Open the queue directory, creating it if needed.
    ///
    /// With `auto_load` the existing files are scanned and crash recovery is
    /// applied before this returns.
    pub fn open(config: QueueConfig) -> QueueResult<Self> {
        let layout = DirLayout::open(&config.dir)?;
        let queue = Self {
            layout,
            config,
            state: Mutex::new(QueueState::default()),
        };
        if queue.config.auto_load {
            queue.reload()?;
        }
        Ok(queue)
    }

    /// Open `dir` with default settings.
    pub fn open_dir(dir: impl AsRef<Path>) -> QueueResult<Self> {
        Self::open(QueueConfig::new(dir.as_ref()))
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dir(&self) -> &Path {
        self.layout.dir()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Throw away the in-memory state and rebuild it from the directory.
    pub fn reload(&self) -> QueueResult<LoadReport> {
        let mut state = self.lock();
        let scan = self.layout.scan()?;
        let mut report = LoadReport {
            skipped: scan.skipped,
            ..LoadReport::default()
        };

        // one winner per id: the most advanced state
        let mut winners: HashMap<String, ScannedItem> = HashMap::new();
        for found in scan.items {
            match winners.entry(found.item.id.clone()) {
                MapEntry::Vacant(v) => {
                    v.insert(found);
                }
                MapEntry::Occupied(mut o) => {
                    let stale =
                        if found.item.status.precedence() > o.get().item.status.precedence() {
                            o.insert(found)
                        } else {
                            found
                        };
                    warn!(id = %stale.item.id, path = %stale.path.display(), "removing duplicate queue file");
                    remove_if_exists(&stale.path)?;
                    report.duplicates += 1;
                }
            }
        }

        let mut items: Vec<_> = winners.into_values().collect();
        items.sort_by(|a, b| a.item.created_at.cmp(&b.item.created_at));

        let mut fresh = QueueState::default();
        for found in items {
            let mut item = found.item;
            let canonical = self.layout.item_path(&item.id, item.status);
            if found.path != canonical {
                self.layout.write_item(&item, None)?;
                remove_if_exists(&found.path)?;
            }
            if item.is_processing() {
                item.reclaim()?;
                self.layout.write_item(&item, Some(ItemStatus::Processing))?;
                if item.is_dead_letter() {
                    error!(id = %item.id, attempts = item.attempts, "interrupted item had no attempts left, dead-lettered");
                } else {
                    info!(id = %item.id, attempts = item.attempts, "recovered interrupted item");
                }
                report.recovered += 1;
            }
            fresh.insert(item);
        }
        report.loaded = fresh.slots.len();
        *state = fresh;

        let counts = state.counts();
        info!(
            dir = %self.layout.dir().display(),
            pending = counts.pending,
            completed = counts.completed,
            failed = counts.failed,
            recovered = report.recovered,
            skipped = report.skipped,
            "queue loaded"
        );
        Ok(report)
    }

    /// Add a payload with a generated id and the configured defaults.
    pub fn add(&self, data: Value) -> QueueResult<QueueItem> {
        self.add_with(data, None, None)
    }

    /// Add a payload, optionally with a caller-supplied id and priority.
    pub fn add_with(
        &self,
        data: Value,
        id: Option<&str>,
        priority: Option<i32>,
    ) -> QueueResult<QueueItem> {
        let mut item = QueueItem::new(data)
            .with_priority(priority.unwrap_or(self.config.default_priority))
            .with_max_attempts(self.config.default_max_attempts);
        if let Some(id) = id {
            item = item.with_id(id);
        }
        self.insert(item)
    }

    /// Store a fully built item as-is.
    ///
    /// Fails with `Duplicate` if the id is already queued and with `Full`
    /// when `max_size` is reached.
    pub fn insert(&self, item: QueueItem) -> QueueResult<QueueItem> {
        let mut state = self.lock();
        if state.slots.contains_key(&item.id) {
            return Err(QueueError::Duplicate(item.id));
        }
        if let Some(capacity) = self.config.max_size
            && state.slots.len() >= capacity
        {
            return Err(QueueError::Full { capacity });
        }
        self.persist(&item, None)?;
        debug!(id = %item.id, priority = item.priority, "queued item");
        state.insert(item.clone());
        Ok(item)
    }

    pub fn get(&self, id: &str) -> Option<QueueItem> {
        self.lock().slots.get(id).map(|s| s.item.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().slots.contains_key(id)
    }

    /// Persist the caller's copy of an item after a `mark_*` call.
    ///
    /// The move from the stored status must be legal; writing the same
    /// status again just rewrites the same file.
    pub fn update(&self, item: &QueueItem) -> QueueResult<()> {
        let mut state = self.lock();
        let stored = state
            .slots
            .get(&item.id)
            .map(|s| s.item.status)
            .ok_or_else(|| QueueError::NotFound(item.id.clone()))?;

        if !stored.can_transition_to(item.status) {
            return Err(QueueError::InvalidTransition {
                id: item.id.clone(),
                from: stored,
                to: item.status,
            });
        }
        if stored != ItemStatus::Pending && item.is_pending() && !item.can_retry() {
            return Err(QueueError::RetryExhausted {
                id: item.id.clone(),
                attempts: item.attempts,
                max_attempts: item.max_attempts,
            });
        }
        self.store(&mut state, item.clone(), stored)
    }

    /// Atomically move a Pending item to Processing, counting an attempt.
    ///
    /// Two workers racing for the same id cannot both win.
    pub fn claim(&self, id: &str) -> QueueResult<QueueItem> {
        self.modify(id, QueueItem::mark_processing)
    }

    pub fn complete(&self, id: &str) -> QueueResult<QueueItem> {
        self.modify(id, QueueItem::mark_completed)
    }

    pub fn fail(&self, id: &str, reason: &str) -> QueueResult<QueueItem> {
        self.modify(id, |item| item.mark_failed(reason))
    }

    /// Processing -> Pending for an item whose worker is gone.
    pub fn reclaim(&self, id: &str) -> QueueResult<QueueItem> {
        self.modify(id, QueueItem::reclaim)
    }

    /// Failed -> Pending while retries remain.
    pub fn requeue(&self, id: &str) -> QueueResult<QueueItem> {
        self.modify(id, QueueItem::reset_for_retry)
    }

    /// Operator override: give a failed (typically dead-lettered) item a
    /// fresh retry budget and queue it again.
    pub fn force_retry(&self, id: &str) -> QueueResult<QueueItem> {
        let item = self.modify(id, |item| {
            if !item.is_failed() {
                return Err(QueueError::InvalidTransition {
                    id: item.id.clone(),
                    from: item.status,
                    to: ItemStatus::Pending,
                });
            }
            item.attempts = 0;
            item.reset_for_retry()
        })?;
        info!(id = %item.id, "forced retry");
        Ok(item)
    }

    /// Apply `f` to a copy of the stored item and persist the result.
    fn modify<F>(&self, id: &str, f: F) -> QueueResult<QueueItem>
    where
        F: FnOnce(&mut QueueItem) -> QueueResult<()>,
    {
        let mut state = self.lock();
        let slot = state
            .slots
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let previous = slot.item.status;
        let mut item = slot.item.clone();
        f(&mut item)?;
        self.store(&mut state, item.clone(), previous)?;
        Ok(item)
    }

    fn store(
        &self,
        state: &mut QueueState,
        item: QueueItem,
        previous: ItemStatus,
    ) -> QueueResult<()> {
        if item.is_completed() && self.config.delete_completed {
            if let Err(e) = self.layout.remove_item(&item.id, previous) {
                error!(id = %item.id, error = %e, "failed to delete completed item");
                return Err(e);
            }
            state.slots.remove(&item.id);
            debug!(id = %item.id, "completed item deleted");
            return Ok(());
        }

        self.persist(&item, Some(previous))?;
        debug!(id = %item.id, from = %previous, to = %item.status, "item updated");
        if let Some(slot) = state.slots.get_mut(&item.id) {
            slot.item = item;
        }
        Ok(())
    }

    fn persist(&self, item: &QueueItem, previous: Option<ItemStatus>) -> QueueResult<()> {
        self.layout.write_item(item, previous).inspect_err(|e| {
            error!(id = %item.id, error = %e, "failed to persist queue item");
        })
    }

    /// Delete an item regardless of status.
    pub fn remove(&self, id: &str) -> QueueResult<Option<QueueItem>> {
        let mut state = self.lock();
        let Some(status) = state.slots.get(id).map(|s| s.item.status) else {
            return Ok(None);
        };
        self.layout.remove_item(id, status)?;
        Ok(state.slots.remove(id).map(|s| s.item))
    }

    /// Delete every item, or every item in `status`. Returns how many went.
    pub fn clear(&self, status: Option<ItemStatus>) -> QueueResult<usize> {
        let mut state = self.lock();
        let doomed: Vec<(String, ItemStatus)> = state
            .slots
            .values()
            .filter(|s| status.is_none_or(|st| s.item.status == st))
            .map(|s| (s.item.id.clone(), s.item.status))
            .collect();

        let mut removed = 0;
        for (id, st) in doomed {
            self.layout.remove_item(&id, st)?;
            state.slots.remove(&id);
            removed += 1;
        }
        if removed > 0 {
            info!(removed, status = ?status.map(ItemStatus::as_str), "cleared queue items");
        }
        Ok(removed)
    }

    pub fn clear_completed(&self) -> QueueResult<usize> {
        self.clear(Some(ItemStatus::Completed))
    }

    /// Highest-priority pending item, without claiming it.
    pub fn get_next(&self) -> Option<QueueItem> {
        let state = self.lock();
        state
            .slots
            .values()
            .filter(|s| s.item.is_pending())
            .min_by(|a, b| a.item.cmp_dispatch(&b.item).then(a.seq.cmp(&b.seq)))
            .map(|s| s.item.clone())
    }

    /// Items in `status`, in dispatch order.
    pub fn list_by_status(&self, status: ItemStatus) -> Vec<QueueItem> {
        self.lock().sorted(Some(status))
    }

    /// Every item, in dispatch order.
    pub fn list_all(&self) -> Vec<QueueItem> {
        self.lock().sorted(None)
    }

    pub fn list_pending(&self) -> Vec<QueueItem> {
        self.list_by_status(ItemStatus::Pending)
    }

    pub fn list_processing(&self) -> Vec<QueueItem> {
        self.list_by_status(ItemStatus::Processing)
    }

    pub fn list_completed(&self) -> Vec<QueueItem> {
        self.list_by_status(ItemStatus::Completed)
    }

    pub fn list_failed(&self) -> Vec<QueueItem> {
        self.list_by_status(ItemStatus::Failed)
    }

    /// Failed items with no retries left.
    pub fn dead_letters(&self) -> Vec<QueueItem> {
        let mut items = self.list_failed();
        items.retain(QueueItem::is_dead_letter);
        items
    }

    /// Error sidecar of a failed item, as written to disk.
    pub fn error_info(&self, id: &str) -> Option<ErrorInfo> {
        self.layout.read_error_info(id)
    }

    pub fn counts(&self) -> QueueCounts {
        self.lock().counts()
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.counts().get(status)
    }

    pub fn size(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn open(dir: &TempDir) -> PersistentQueue {
        PersistentQueue::open_dir(dir.path()).unwrap()
    }

    fn files(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn add_persists_pending_item() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let item = queue
            .add_with(json!({ "sn": "A" }), Some("TEST-001"), None)
            .unwrap();

        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.priority, 5);
        assert_eq!(files(&dir), vec!["TEST-001.queued"]);
        assert_eq!(queue.get("TEST-001"), Some(item));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        queue.add_with(json!(1), Some("X"), None).unwrap();
        let err = queue.add_with(json!(2), Some("X"), None).unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(id) if id == "X"));
        assert_eq!(queue.get("X").unwrap().data, json!(1));
    }

    #[test]
    fn max_size_is_enforced() {
        let dir = tempdir().unwrap();
        let mut config = QueueConfig::new(dir.path());
        config.max_size = Some(2);
        let queue = PersistentQueue::open(config).unwrap();
        queue.add(json!(1)).unwrap();
        queue.add(json!(2)).unwrap();
        assert!(matches!(
            queue.add(json!(3)),
            Err(QueueError::Full { capacity: 2 })
        ));
    }

    #[test]
    fn add_into_unwritable_dir_is_an_io_error() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        drop(dir);
        let err = queue.add(json!({})).unwrap_err();
        assert!(err.is_storage());
        assert!(queue.is_empty());
    }

    #[test]
    fn dispatch_follows_priority_then_fifo() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let ids: Vec<String> = [10, 1, 5, 1]
            .into_iter()
            .map(|p| queue.add_with(json!(p), None, Some(p)).unwrap().id)
            .collect();

        let order: Vec<String> = queue.list_pending().into_iter().map(|i| i.id).collect();
        assert_eq!(
            order,
            vec![ids[1].clone(), ids[3].clone(), ids[2].clone(), ids[0].clone()]
        );
        assert_eq!(queue.get_next().unwrap().id, ids[1]);
    }

    #[test]
    fn update_is_idempotent_and_validated() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let mut item = queue.add(json!({})).unwrap();

        item.mark_processing().unwrap();
        queue.update(&item).unwrap();
        queue.update(&item).unwrap();
        assert_eq!(queue.get(&item.id).unwrap().attempts, 1);

        item.mark_completed().unwrap();
        queue.update(&item).unwrap();

        // a stale copy must not drag a completed item back
        let mut stale = item.clone();
        stale.status = ItemStatus::Pending;
        assert!(matches!(
            queue.update(&stale),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(queue.get(&item.id).unwrap().is_completed());
        assert!(matches!(
            queue.update(&QueueItem::new(json!(0))),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn claim_is_exclusive() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let id = queue.add(json!({})).unwrap().id;

        let claimed = queue.claim(&id).unwrap();
        assert_eq!(claimed.attempts, 1);
        assert!(matches!(
            queue.claim(&id),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert_eq!(queue.get(&id).unwrap().attempts, 1);
    }

    #[test]
    fn concurrent_adds_from_threads() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(open(&dir));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for n in 0..10 {
                        queue.add(json!({ "thread": t, "n": n })).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.size(), 80);
        assert_eq!(files(&dir).len(), 80);
    }

    #[test]
    fn restart_recovers_processing_items() {
        let dir = tempdir().unwrap();
        let (pending, stuck, done) = {
            let queue = open(&dir);
            let pending = queue.add(json!("p")).unwrap().id;
            let stuck = queue.add(json!("s")).unwrap().id;
            let done = queue.add(json!("d")).unwrap().id;
            queue.claim(&stuck).unwrap();
            queue.claim(&done).unwrap();
            queue.complete(&done).unwrap();
            (pending, stuck, done)
            // process "dies" here
        };

        let queue = open(&dir);
        let recovered = queue.get(&stuck).unwrap();
        assert_eq!(recovered.status, ItemStatus::Pending);
        assert_eq!(recovered.attempts, 1);
        assert!(queue.get(&pending).unwrap().is_pending());
        assert!(queue.get(&done).unwrap().is_completed());
        assert!(!files(&dir).iter().any(|f| f.ends_with(".processing")));
        assert_eq!(queue.counts().pending, 2);
    }

    #[test]
    fn restart_dead_letters_item_interrupted_on_last_attempt() {
        let dir = tempdir().unwrap();
        let id = {
            let queue = open(&dir);
            let id = queue
                .insert(QueueItem::new(json!({})).with_max_attempts(2))
                .unwrap()
                .id;
            queue.claim(&id).unwrap();
            queue.fail(&id, "HTTP 503").unwrap();
            queue.requeue(&id).unwrap();
            queue.claim(&id).unwrap();
            id
            // dies during the final attempt
        };

        let queue = open(&dir);
        let item = queue.get(&id).unwrap();
        assert!(item.is_dead_letter());
        assert_eq!(item.attempts, 2);
        assert!(queue.claim(&id).is_err());
        assert_eq!(queue.error_info(&id).unwrap().attempts, 2);
        assert!(files(&dir).iter().any(|f| f.ends_with(".error")));
    }

    #[test]
    fn update_cannot_reclaim_exhausted_item_to_pending() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let id = queue
            .insert(QueueItem::new(json!({})).with_max_attempts(1))
            .unwrap()
            .id;
        let mut item = queue.claim(&id).unwrap();
        item.status = ItemStatus::Pending;
        assert!(matches!(
            queue.update(&item),
            Err(QueueError::RetryExhausted { .. })
        ));
        assert!(queue.get(&id).unwrap().is_processing());
    }

    #[test]
    fn reload_reports_and_skips_corruption() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let id = queue.add(json!({})).unwrap().id;
        queue.claim(&id).unwrap();
        fs::write(dir.path().join("corrupted.queued"), "{ invalid json }").unwrap();
        fs::write(dir.path().join("partial.queued.tmp"), "{").unwrap();

        let report = queue.reload().unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.skipped, 1);
        assert!(!dir.path().join("partial.queued.tmp").exists());
        assert!(dir.path().join("corrupted.queued").exists());
    }

    #[test]
    fn duplicate_artifacts_resolve_to_most_advanced_state() {
        let dir = tempdir().unwrap();
        {
            let queue = open(&dir);
            queue.add_with(json!({}), Some("DUP"), None).unwrap();
            queue.claim("DUP").unwrap();
            queue.complete("DUP").unwrap();
        }
        // simulate a crash that left the old artifact behind
        let body = fs::read(dir.path().join("DUP.completed")).unwrap();
        fs::write(dir.path().join("DUP.queued"), body).unwrap();

        let queue = open(&dir);
        assert!(queue.get("DUP").unwrap().is_completed());
        assert_eq!(files(&dir), vec!["DUP.completed"]);
    }

    #[test]
    fn special_character_ids_roundtrip() {
        let dir = tempdir().unwrap();
        let long = format!("LONG-{}", "X".repeat(300));
        {
            let queue = open(&dir);
            queue.add_with(json!(1), Some("TEST@123#456"), None).unwrap();
            queue.add_with(json!(2), Some("TEST_123_456"), None).unwrap();
            queue.add_with(json!(3), Some("../escape"), None).unwrap();
            queue.add_with(json!(4), Some(&long), None).unwrap();
        }
        let queue = open(&dir);
        assert_eq!(queue.get("TEST@123#456").unwrap().data, json!(1));
        assert_eq!(queue.get("TEST_123_456").unwrap().data, json!(2));
        assert_eq!(queue.get("../escape").unwrap().data, json!(3));
        assert_eq!(queue.get(&long).unwrap().data, json!(4));
        assert_eq!(files(&dir).len(), 4);
    }

    #[test]
    fn failure_writes_sidecar_and_retry_exhausts() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let id = queue.add(json!({})).unwrap().id;

        for n in 1..=3 {
            if n > 1 {
                queue.requeue(&id).unwrap();
            }
            queue.claim(&id).unwrap();
            queue.fail(&id, "HTTP 503").unwrap();
        }
        let item = queue.get(&id).unwrap();
        assert_eq!(item.attempts, 3);
        assert!(!item.can_retry());
        assert!(matches!(
            queue.requeue(&id),
            Err(QueueError::RetryExhausted { .. })
        ));
        assert_eq!(queue.dead_letters().len(), 1);

        let info = queue.error_info(&id).unwrap();
        assert_eq!(info.attempts, 3);
        assert_eq!(info.error.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn failed_sidecar_write_leaves_item_processing() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        queue.add_with(json!({}), Some("SIDE-1"), None).unwrap();
        queue.claim("SIDE-1").unwrap();
        // a directory where the sidecar should go makes its rename fail
        fs::create_dir(dir.path().join("SIDE-1.error.info")).unwrap();

        let err = queue.fail("SIDE-1", "HTTP 503").unwrap_err();
        assert!(err.is_storage());
        assert!(queue.get("SIDE-1").unwrap().is_processing());
        assert!(dir.path().join("SIDE-1.processing").exists());
        assert!(!dir.path().join("SIDE-1.error").exists());
    }

    #[test]
    fn update_cannot_bypass_retry_budget() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let mut item = queue.insert(QueueItem::new(json!({})).with_max_attempts(1)).unwrap();
        item.mark_processing().unwrap();
        item.mark_failed("x").unwrap();
        queue.update(&item).unwrap();

        let mut sneaky = item.clone();
        sneaky.status = ItemStatus::Pending;
        assert!(matches!(
            queue.update(&sneaky),
            Err(QueueError::RetryExhausted { .. })
        ));
    }

    #[test]
    fn force_retry_resets_dead_letter() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let id = queue
            .insert(QueueItem::new(json!({})).with_max_attempts(1))
            .unwrap()
            .id;
        queue.claim(&id).unwrap();
        queue.fail(&id, "bad").unwrap();
        assert_eq!(queue.dead_letters().len(), 1);

        let item = queue.force_retry(&id).unwrap();
        assert!(item.is_pending());
        assert_eq!(item.attempts, 0);
        assert!(queue.error_info(&id).is_none());
        assert!(queue.dead_letters().is_empty());

        assert!(queue.force_retry(&id).is_err());
    }

    #[test]
    fn clear_by_status_and_all() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let a = queue.add(json!("a")).unwrap().id;
        queue.add(json!("b")).unwrap();
        queue.claim(&a).unwrap();
        queue.complete(&a).unwrap();

        assert_eq!(queue.clear_completed().unwrap(), 1);
        assert_eq!(queue.counts().completed, 0);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.clear(None).unwrap(), 1);
        assert!(queue.is_empty());
        assert!(files(&dir).is_empty());
    }

    #[test]
    fn delete_completed_removes_files() {
        let dir = tempdir().unwrap();
        let mut config = QueueConfig::new(dir.path());
        config.delete_completed = true;
        let queue = PersistentQueue::open(config).unwrap();
        let id = queue.add(json!({})).unwrap().id;
        queue.claim(&id).unwrap();
        queue.complete(&id).unwrap();

        assert!(queue.get(&id).is_none());
        assert!(files(&dir).is_empty());
    }

    #[test]
    fn remove_deletes_file_and_sidecar() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let id = queue.add(json!({})).unwrap().id;
        queue.claim(&id).unwrap();
        queue.fail(&id, "x").unwrap();
        assert_eq!(files(&dir).len(), 2);

        assert!(queue.remove(&id).unwrap().is_some());
        assert!(queue.remove(&id).unwrap().is_none());
        assert!(files(&dir).is_empty());
    }

    #[test]
    fn counts_by_status() {
        let dir = tempdir().unwrap();
        let queue = open(&dir);
        let a = queue.add(json!(1)).unwrap().id;
        let b = queue.add(json!(2)).unwrap().id;
        queue.add(json!(3)).unwrap();
        queue.claim(&a).unwrap();
        queue.claim(&b).unwrap();
        queue.fail(&b, "x").unwrap();

        let counts = queue.counts();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total, 3);
        assert_eq!(queue.count(ItemStatus::Failed), 1);
    }

    #[test]
    fn without_auto_load_existing_files_are_ignored() {
        let dir = tempdir().unwrap();
        open(&dir).add(json!({})).unwrap();

        let mut config = QueueConfig::new(dir.path());
        config.auto_load = false;
        let queue = PersistentQueue::open(config).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.reload().unwrap().loaded, 1);
    }
}
