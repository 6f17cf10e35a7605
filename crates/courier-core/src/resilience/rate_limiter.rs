//! Per-key token bucket rate limiter.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimiterConfig;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    granted: u64,
    rejected: u64,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
            granted: 0,
            rejected: 0,
        }
    }

    fn refill(&mut self, now: Instant, capacity: f64, per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Snapshot of one client's bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStats {
    pub key: String,
    pub available: f64,
    pub capacity: u32,
    pub granted: u64,
    pub rejected: u64,
}

/// Admission control for outbound submissions.
///
/// Each key owns a bucket of `burst_size` tokens (default `max_requests`)
/// refilled continuously at `max_requests / window`. Tokens come back on
/// their own as time passes; there is no release call. Keys never share a
/// budget.
///
/// With `enabled = false` every acquisition succeeds at once and no state is
/// kept.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(RateLimiterConfig::disabled())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.capacity())
    }

    fn per_sec(&self) -> f64 {
        let window = self.config.window().as_secs_f64();
        if window <= 0.0 {
            return f64::INFINITY;
        }
        f64::from(self.config.max_requests) / window
    }

    /// Take one token or report how long until one is available.
    fn take(&self, key: &str) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }
        let (capacity, per_sec) = (self.capacity(), self.per_sec());
        let now = Instant::now();
        let mut buckets = self.lock();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(capacity, now));

        bucket.refill(now, capacity, per_sec);
        bucket.last_seen = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.granted += 1;
            return Ok(());
        }
        if per_sec <= 0.0 || capacity < 1.0 {
            return Err(Duration::MAX);
        }
        let missing = 1.0 - bucket.tokens;
        Err(Duration::from_secs_f64(missing / per_sec))
    }

    fn note_rejection(&self, key: &str) {
        if let Some(bucket) = self.lock().get_mut(key) {
            bucket.rejected += 1;
        }
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self, key: &str) -> bool {
        match self.take(key) {
            Ok(()) => true,
            Err(_) => {
                self.note_rejection(key);
                false
            }
        }
    }

    /// Wait up to `timeout` for a token. Returns false on timeout.
    ///
    /// A timeout too large to represent as an instant waits without limit.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let wait = match self.take(key) {
                Ok(()) => return true,
                Err(wait) => wait,
            };
            let now = Instant::now();
            let too_late = deadline.is_some_and(|d| now >= d || wait > d - now);
            if too_late {
                self.note_rejection(key);
                debug!(key, wait_ms = wait.as_millis() as u64, "rate limit slot not available in time");
                return false;
            }
            debug!(key, wait_ms = wait.as_millis() as u64, "waiting for rate limit slot");
            tokio::time::sleep(wait).await;
        }
    }

    /// Forget a key's history (its bucket starts full again).
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Evict keys idle for longer than `max_age`. Returns how many went.
    pub fn cleanup_old_clients(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) <= max_age);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, "evicted idle rate limit clients");
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Current bucket for `key`; a key never seen reports a full bucket.
    pub fn stats(&self, key: &str) -> LimiterStats {
        let (capacity, per_sec) = (self.capacity(), self.per_sec());
        let now = Instant::now();
        let mut buckets = self.lock();
        let (available, granted, rejected) = match buckets.get_mut(key) {
            Some(bucket) => {
                bucket.refill(now, capacity, per_sec);
                (bucket.tokens, bucket.granted, bucket.rejected)
            }
            None => (capacity, 0, 0),
        };
        LimiterStats {
            key: key.to_string(),
            available,
            capacity: self.config.capacity(),
            granted,
            rejected,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
