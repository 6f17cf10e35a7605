//! Queue item: payload + delivery bookkeeping.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ItemStatus;
use crate::domain::ids::generate_item_id;
use crate::error::{QueueError, QueueResult};

/// Priority used when none is given (1 = most urgent, 10 = least).
pub const DEFAULT_PRIORITY: i32 = 5;

/// Attempts allowed when none is given.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// `last_error` of an item reclaimed with no attempts left.
pub const INTERRUPTED_ON_LAST_ATTEMPT: &str = "interrupted during the final attempt";

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// A unit of work waiting to be delivered to the remote collector.
///
/// Design:
/// - This is the "single source of truth" for an item's state.
/// - All state transitions happen through the `mark_*` methods, which refuse
///   illegal moves instead of silently overwriting `status`.
/// - `data` is opaque: the queue never looks inside it.
///
/// The serialized form is what lands on disk. `priority`, `attempts`,
/// `max_attempts`, `last_error` and `metadata` fall back to defaults when
/// missing so files written by older clients still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,

    pub data: serde_json::Value,

    pub status: ItemStatus,

    /// Lower value is serviced first.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Number of times this item entered Processing.
    #[serde(default)]
    pub attempts: u32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub last_error: Option<String>,

    /// Free-form tags (non-authoritative).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Dispatch ordering key: `(priority, created_at)` ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DispatchKey {
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create a pending item with a generated id and default settings.
    pub fn new(data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: generate_item_id(),
            data,
            status: ItemStatus::Pending,
            priority: DEFAULT_PRIORITY,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            updated_at: now,
            last_error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn transition(&mut self, to: ItemStatus) -> QueueResult<()> {
        if self.status == to || !self.status.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        // never move backwards, even if the wall clock does
        self.updated_at = Utc::now().max(self.updated_at);
    }

    /// Pending -> Processing. Counts one attempt.
    pub fn mark_processing(&mut self) -> QueueResult<()> {
        self.transition(ItemStatus::Processing)?;
        self.attempts += 1;
        Ok(())
    }

    /// Processing -> Completed.
    pub fn mark_completed(&mut self) -> QueueResult<()> {
        self.transition(ItemStatus::Completed)?;
        self.last_error = None;
        Ok(())
    }

    /// Processing -> Failed, recording the reason.
    ///
    /// The attempt was already counted on entry to Processing.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> QueueResult<()> {
        self.transition(ItemStatus::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Failed -> Pending, only while retries remain.
    pub fn reset_for_retry(&mut self) -> QueueResult<()> {
        if self.status == ItemStatus::Failed && !self.can_retry() {
            return Err(QueueError::RetryExhausted {
                id: self.id.clone(),
                attempts: self.attempts,
                max_attempts: self.max_attempts,
            });
        }
        if self.status != ItemStatus::Failed {
            return Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: ItemStatus::Pending,
            });
        }
        self.transition(ItemStatus::Pending)
    }

    /// Processing -> Pending, for items whose worker died mid-flight.
    ///
    /// The attempt stays counted: there is no record of whether the remote
    /// saw the payload. An item interrupted on its last attempt goes to
    /// Failed instead and is a dead letter from then on.
    pub fn reclaim(&mut self) -> QueueResult<()> {
        if self.status != ItemStatus::Processing {
            return Err(QueueError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: ItemStatus::Pending,
            });
        }
        if !self.can_retry() {
            return self.mark_failed(INTERRUPTED_ON_LAST_ATTEMPT);
        }
        self.transition(ItemStatus::Pending)
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Failed with no retries left.
    pub fn is_dead_letter(&self) -> bool {
        self.status == ItemStatus::Failed && !self.can_retry()
    }

    pub fn is_pending(&self) -> bool {
        self.status == ItemStatus::Pending
    }

    pub fn is_processing(&self) -> bool {
        self.status == ItemStatus::Processing
    }

    pub fn is_completed(&self) -> bool {
        self.status == ItemStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == ItemStatus::Failed
    }

    pub fn dispatch_key(&self) -> DispatchKey {
        DispatchKey {
            priority: self.priority,
            created_at: self.created_at,
        }
    }

    /// Compare by dispatch order: lower priority value first, then older first.
    pub fn cmp_dispatch(&self, other: &Self) -> Ordering {
        self.dispatch_key().cmp(&other.dispatch_key())
    }

    pub fn to_value(&self) -> QueueResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> QueueResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report() -> serde_json::Value {
        json!({ "unit_serial_number": "TEST-123", "result": "Passed" })
    }

    #[test]
    fn new_item_defaults() {
        let item = QueueItem::new(report());
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.priority, DEFAULT_PRIORITY);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.max_attempts, 3);
        assert!(item.last_error.is_none());
        assert!(item.metadata.is_empty());
        assert!(!item.id.is_empty());
    }

    #[test]
    fn mark_processing_counts_one_attempt() {
        let mut item = QueueItem::new(report());
        let before = item.updated_at;
        item.mark_processing().unwrap();
        assert_eq!(item.status, ItemStatus::Processing);
        assert_eq!(item.attempts, 1);
        assert!(item.updated_at >= before);
    }

    #[test]
    fn mark_failed_records_error_without_double_counting() {
        let mut item = QueueItem::new(report());
        item.mark_processing().unwrap();
        item.mark_failed("Connection error").unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.last_error.as_deref(), Some("Connection error"));
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn mark_completed_clears_error() {
        let mut item = QueueItem::new(report());
        item.mark_processing().unwrap();
        item.mark_failed("boom").unwrap();
        item.reset_for_retry().unwrap();
        item.mark_processing().unwrap();
        item.mark_completed().unwrap();
        assert!(item.is_completed());
        assert!(item.last_error.is_none());
        assert_eq!(item.attempts, 2);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut item = QueueItem::new(report());
        assert!(matches!(
            item.mark_completed(),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(item.mark_failed("x").is_err());
        assert!(item.reclaim().is_err());

        item.mark_processing().unwrap();
        assert!(item.mark_processing().is_err());
        item.mark_completed().unwrap();
        assert!(item.mark_processing().is_err());
        assert!(item.reset_for_retry().is_err());
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn retry_exhaustion() {
        let mut item = QueueItem::new(report()).with_max_attempts(3);
        for _ in 0..3 {
            if item.is_failed() {
                item.reset_for_retry().unwrap();
            }
            item.mark_processing().unwrap();
            item.mark_failed("always fails").unwrap();
        }
        assert_eq!(item.attempts, 3);
        assert!(!item.can_retry());
        assert!(item.is_dead_letter());
        assert!(matches!(
            item.reset_for_retry(),
            Err(QueueError::RetryExhausted { attempts: 3, max_attempts: 3, .. })
        ));
    }

    #[test]
    fn reclaim_keeps_attempt_count() {
        let mut item = QueueItem::new(report());
        item.mark_processing().unwrap();
        item.reclaim().unwrap();
        assert!(item.is_pending());
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn reclaim_on_final_attempt_dead_letters() {
        let mut item = QueueItem::new(report()).with_max_attempts(2);
        item.mark_processing().unwrap();
        item.reclaim().unwrap();
        item.mark_processing().unwrap();

        item.reclaim().unwrap();
        assert!(item.is_dead_letter());
        assert_eq!(item.attempts, 2);
        assert_eq!(item.last_error.as_deref(), Some(INTERRUPTED_ON_LAST_ATTEMPT));
        assert!(item.mark_processing().is_err());
    }

    #[test]
    fn dispatch_order_is_priority_then_fifo() {
        let a = QueueItem::new(json!(1)).with_priority(10);
        let b = QueueItem::new(json!(2)).with_priority(1);
        let mut c = QueueItem::new(json!(3)).with_priority(1);
        c.created_at = b.created_at + chrono::Duration::milliseconds(1);
        let mut items = vec![a.clone(), c.clone(), b.clone()];
        items.sort_by(|x, y| x.cmp_dispatch(y));
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![b.id.as_str(), c.id.as_str(), a.id.as_str()]);
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let mut item = QueueItem::new(report())
            .with_id("TEST-001")
            .with_priority(2)
            .with_max_attempts(5)
            .with_metadata("converter", "xml");
        item.mark_processing().unwrap();
        item.mark_failed("Some error").unwrap();

        let back = QueueItem::from_value(item.to_value().unwrap()).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn missing_priority_defaults_for_older_files() {
        let value = json!({
            "id": "OLD-001",
            "data": "restored_data",
            "status": "processing",
            "attempts": 2,
            "max_attempts": 5,
            "created_at": "2026-02-13T10:00:00Z",
            "updated_at": "2026-02-13T10:05:00Z",
            "last_error": "Some error"
        });
        let item = QueueItem::from_value(value).unwrap();
        assert_eq!(item.priority, DEFAULT_PRIORITY);
        assert_eq!(item.status, ItemStatus::Processing);
        assert_eq!(item.attempts, 2);
        assert_eq!(item.data, json!("restored_data"));
        assert!(item.metadata.is_empty());
    }
}
