//! Configuration for the queue, the submitter and the resilience gates.
//!
//! Every struct implements `Default` and deserializes with
//! `#[serde(default)]`, so a partial JSON document only needs the fields it
//! wants to change:
//!
//! ```json
//! { "queue": { "dir": "/var/lib/courier" }, "submitter": { "max_concurrent": 2 } }
//! ```
//!
//! Durations are stored as `*_ms` integers and exposed as [`Duration`]s.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::{DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, RetryPolicy};

/// Persistent queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory owned by the queue. Created on open.
    pub dir: PathBuf,

    /// Scan the directory (and run crash recovery) on open.
    pub auto_load: bool,

    /// Delete completed items instead of keeping them as `.completed` files.
    pub delete_completed: bool,

    pub default_priority: i32,

    pub default_max_attempts: u32,

    /// Maximum number of items held at once (None = unbounded).
    pub max_size: Option<usize>,
}

impl QueueConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("queue"),
            auto_load: true,
            delete_completed: false,
            default_priority: DEFAULT_PRIORITY,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_size: None,
        }
    }
}

/// Async submitter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    /// Hard upper bound on simultaneous in-flight submissions.
    pub max_concurrent: usize,

    /// Delay between rounds of the run loop.
    pub poll_interval_ms: u64,

    /// Age after which a Processing item is considered abandoned.
    pub stuck_after_ms: u64,

    /// Cooldown before a Failed item is queued again.
    pub retry_after_ms: u64,

    /// How long shutdown waits for in-flight submissions.
    pub stop_timeout_ms: u64,

    /// How long a submission may wait for a rate-limit slot.
    pub acquire_timeout_ms: u64,

    /// Rate limiter bucket used for submissions.
    pub rate_limit_key: String,

    /// Backoff multiplier for repeated failures (1.0 = fixed cooldown).
    pub retry_multiplier: f64,

    pub max_retry_delay_ms: u64,

    /// Random spread on the retry cooldown, 0.0..=1.0.
    pub retry_jitter: f64,
}

impl SubmitterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_millis(self.stuck_after_ms)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Retry policy derived from the cooldown settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry_after(),
            self.retry_multiplier,
            Duration::from_millis(self.max_retry_delay_ms),
        )
        .with_jitter(self.retry_jitter)
    }
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            poll_interval_ms: 5_000,
            stuck_after_ms: 300_000,
            retry_after_ms: 300_000,
            stop_timeout_ms: 30_000,
            acquire_timeout_ms: 30_000,
            rate_limit_key: "default".to_string(),
            retry_multiplier: 1.0,
            max_retry_delay_ms: 3_600_000,
            retry_jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,

    /// Consecutive probe successes that close it again.
    pub success_threshold: u32,

    /// Time spent open before a probe is allowed.
    pub timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// When false every acquisition succeeds immediately.
    pub enabled: bool,

    /// Requests allowed per window.
    pub max_requests: u32,

    pub window_ms: u64,

    /// Bucket capacity; defaults to `max_requests`.
    pub burst_size: Option<u32>,
}

impl RateLimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn capacity(&self) -> u32 {
        self.burst_size.unwrap_or(self.max_requests)
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 500,
            window_ms: 60_000,
            burst_size: None,
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub queue: QueueConfig,
    pub submitter: SubmitterConfig,
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimiterConfig,
}

impl CourierConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Reject settings that would make a component unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.submitter.max_concurrent == 0 {
            return invalid("submitter.max_concurrent must be at least 1");
        }
        if self.queue.default_max_attempts == 0 {
            return invalid("queue.default_max_attempts must be at least 1");
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return invalid("breaker thresholds must be at least 1");
        }
        if self.rate_limit.enabled
            && (self.rate_limit.max_requests == 0
                || self.rate_limit.capacity() == 0
                || self.rate_limit.window_ms == 0)
        {
            return invalid("rate_limit needs max_requests, burst_size and window_ms above 0");
        }
        if !(0.0..=1.0).contains(&self.submitter.retry_jitter) {
            return invalid("submitter.retry_jitter must be within 0.0..=1.0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CourierConfig::default();
        assert!(config.queue.auto_load);
        assert!(!config.queue.delete_completed);
        assert_eq!(config.queue.default_priority, 5);
        assert_eq!(config.queue.default_max_attempts, 3);
        assert_eq!(config.submitter.max_concurrent, 5);
        assert_eq!(config.submitter.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.submitter.retry_after(), Duration::from_secs(300));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.success_threshold, 2);
        assert_eq!(config.breaker.timeout(), Duration::from_secs(60));
        assert_eq!(config.rate_limit.capacity(), 500);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = CourierConfig::from_json_str(
            r#"{ "queue": { "dir": "/tmp/q" }, "submitter": { "max_concurrent": 2 },
                 "rate_limit": { "burst_size": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.queue.dir, PathBuf::from("/tmp/q"));
        assert!(config.queue.auto_load);
        assert_eq!(config.submitter.max_concurrent, 2);
        assert_eq!(config.submitter.stuck_after_ms, 300_000);
        assert_eq!(config.rate_limit.capacity(), 5);
        assert_eq!(config.rate_limit.max_requests, 500);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = CourierConfig::from_json_str(r#"{ "submitter": { "max_concurrent": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = CourierConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        // a disabled limiter does not care about its budget
        let ok = CourierConfig::from_json_str(
            r#"{ "rate_limit": { "enabled": false, "max_requests": 0 } }"#,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.json");
        fs::write(&path, r#"{ "breaker": { "failure_threshold": 3 } }"#).unwrap();
        let config = CourierConfig::from_path(&path).unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);

        let missing = CourierConfig::from_path(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn retry_policy_follows_submitter_settings() {
        let config = SubmitterConfig {
            retry_after_ms: 1_000,
            retry_multiplier: 2.0,
            max_retry_delay_ms: 3_000,
            ..SubmitterConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(3));
    }
}
