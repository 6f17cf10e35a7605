//! Queue module: item state machine, retry policy and the directory-backed
//! persistent queue.

mod item;
mod layout;
mod persistent;
mod retry;
mod state;

pub use item::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, DispatchKey, INTERRUPTED_ON_LAST_ATTEMPT, QueueItem,
};
pub use layout::ErrorInfo;
pub use persistent::{LoadReport, PersistentQueue};
pub use retry::RetryPolicy;
pub use state::ItemStatus;
