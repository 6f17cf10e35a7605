use serde::{Deserialize, Serialize};

use crate::queue::ItemStatus;

/// Item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl QueueCounts {
    pub(crate) fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Pending => self.pending += 1,
            ItemStatus::Processing => self.processing += 1,
            ItemStatus::Completed => self.completed += 1,
            ItemStatus::Failed => self.failed += 1,
        }
        self.total += 1;
    }

    pub fn get(&self, status: ItemStatus) -> usize {
        match status {
            ItemStatus::Pending => self.pending,
            ItemStatus::Processing => self.processing,
            ItemStatus::Completed => self.completed,
            ItemStatus::Failed => self.failed,
        }
    }

    /// Nothing left to deliver (pending or in flight).
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Running totals kept by the submitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitterStats {
    /// Remote calls made.
    pub total_submitted: u64,
    pub successful: u64,
    pub errors: u64,
    /// Items not sent because the breaker was open.
    pub breaker_rejections: u64,
    /// Items not sent because no rate-limit slot became free in time.
    pub deferred: u64,
    /// Submissions in flight right now.
    pub active_uploads: usize,
}
