//! Item state machine for the queue.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Item status.
///
/// State transitions:
/// - Pending -> Processing -> Completed (terminal)
/// - Pending -> Processing -> Failed (terminal unless retried)
/// - Failed -> Pending (retry, only while attempts < max_attempts)
/// - Processing -> Pending (crash recovery / stuck reclaim only)
///
/// The on-disk suffix of an item file is derived from this enum, so a
/// directory listing alone is enough to rebuild queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting to be submitted.
    Pending,

    /// Currently being submitted by a worker.
    Processing,

    /// Acknowledged by the remote collector.
    Completed,

    /// Last submission failed.
    Failed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::Pending,
        ItemStatus::Processing,
        ItemStatus::Completed,
        ItemStatus::Failed,
    ];

    /// Is this a terminal state (no further automatic transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed)
    }

    /// Is this item eligible for dispatch?
    pub fn is_runnable(self) -> bool {
        matches!(self, ItemStatus::Pending)
    }

    /// Is `self -> next` a legal transition?
    ///
    /// Staying in the same state is always allowed so that persisting the
    /// same item twice is idempotent.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Processing)
                    | (Processing, Completed)
                    | (Processing, Failed)
                    | (Processing, Pending)
                    | (Failed, Pending)
            )
    }

    /// File suffix encoding this status on disk.
    pub fn suffix(self) -> &'static str {
        match self {
            ItemStatus::Pending => "queued",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "error",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        ItemStatus::ALL.into_iter().find(|s| s.suffix() == suffix)
    }

    /// Precedence used when one id shows up under several suffixes.
    ///
    /// The most advanced state wins.
    pub(crate) fn precedence(self) -> u8 {
        match self {
            ItemStatus::Pending => 0,
            ItemStatus::Processing => 1,
            ItemStatus::Failed => 2,
            ItemStatus::Completed => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ItemStatus::*;

    #[rstest]
    #[case::claim(Pending, Processing, true)]
    #[case::complete(Processing, Completed, true)]
    #[case::fail(Processing, Failed, true)]
    #[case::reclaim(Processing, Pending, true)]
    #[case::retry(Failed, Pending, true)]
    #[case::idempotent(Completed, Completed, true)]
    #[case::skip_processing(Pending, Completed, false)]
    #[case::fail_without_processing(Pending, Failed, false)]
    #[case::resubmit_completed(Completed, Pending, false)]
    #[case::completed_to_processing(Completed, Processing, false)]
    #[case::failed_to_processing(Failed, Processing, false)]
    #[case::failed_to_completed(Failed, Completed, false)]
    fn transition_table(#[case] from: ItemStatus, #[case] to: ItemStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn suffix_roundtrip() {
        for status in ItemStatus::ALL {
            assert_eq!(ItemStatus::from_suffix(status.suffix()), Some(status));
        }
        assert_eq!(ItemStatus::from_suffix("info"), None);
        assert_eq!(ItemStatus::from_suffix("tmp"), None);
    }

    #[test]
    fn serializes_lowercase() {
        let s = serde_json::to_string(&Failed).unwrap();
        assert_eq!(s, "\"failed\"");
    }

    #[test]
    fn completed_outranks_everything() {
        assert!(Completed.precedence() > Failed.precedence());
        assert!(Failed.precedence() > Processing.precedence());
        assert!(Processing.precedence() > Pending.precedence());
    }
}
