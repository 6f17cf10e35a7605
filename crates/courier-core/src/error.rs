use std::path::PathBuf;

use thiserror::Error;

use crate::queue::ItemStatus;

/// Errors raised by the persistent queue and the item state machine.
///
/// `Io` and `Serialization` are storage failures: the in-memory state was
/// not changed and the caller must not assume the update happened.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("item {id} has no retries left ({attempts}/{max_attempts})")]
    RetryExhausted {
        id: String,
        attempts: u32,
        max_attempts: u32,
    },

    #[error("item already exists: {0}")]
    Duplicate(String),

    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },
}

impl QueueError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QueueError::Io {
            path: path.into(),
            source,
        }
    }

    /// Is this a storage failure (disk full, permission denied, ...)?
    pub fn is_storage(&self) -> bool {
        matches!(self, QueueError::Io { .. } | QueueError::Serialization(_))
    }
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the async submitter to its caller.
///
/// Item-level delivery failures are not errors here: they are recorded on
/// the item. Only conditions with no local remediation propagate.
#[derive(Debug, Error)]
pub enum SubmitterError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("circuit breaker '{name}' is open")]
    BreakerOpen { name: String },

    #[error("submitter is already running")]
    AlreadyRunning,
}

/// Error returned by [`CircuitBreaker::call`](crate::resilience::CircuitBreaker::call).
///
/// `Open` means the operation was never invoked.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Open { .. } => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

/// Errors from the sync-to-async bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot block on a runtime from inside a running tokio runtime")]
    NestedRuntime,

    #[error("failed to build runtime: {0}")]
    Build(#[source] std::io::Error),

    #[error("operation timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
