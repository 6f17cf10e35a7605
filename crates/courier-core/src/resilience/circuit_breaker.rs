//! Circuit breaker guarding the remote collector.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::domain::DeliveryError;
use crate::error::BreakerError;

/// Breaker state.
///
/// State transitions:
/// - Closed -> Open: `failure_threshold` consecutive failures
/// - Open -> HalfOpen: `timeout` elapsed since the breaker opened
/// - HalfOpen -> Closed: `success_threshold` consecutive probe successes
/// - HalfOpen -> Open: any probe failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know whether they say something about the remote's health.
pub trait BreakerFailure {
    /// Should this error count toward opening the breaker?
    fn counts_as_failure(&self) -> bool;
}

impl BreakerFailure for DeliveryError {
    fn counts_as_failure(&self) -> bool {
        self.kind().counts_as_failure()
    }
}

/// Point-in-time snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_ignored: u64,
    pub total_rejections: u64,
    /// Time left before an open breaker lets a probe through.
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Consecutive failures (Closed).
    failure_count: u32,
    /// Consecutive probe successes (HalfOpen).
    success_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// Bumped on every state change; verdicts from older permits are stale.
    generation: u64,

    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_ignored: u64,
    total_rejections: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            probe_in_flight: false,
            generation: 0,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_ignored: 0,
            total_rejections: 0,
        }
    }

    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.generation += 1;
        self.probe_in_flight = false;
        self.success_count = 0;
        match state {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.opened_at = None;
            }
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => {}
        }
    }
}

/// Circuit breaker.
///
/// Design:
/// - The breaker never inspects error types itself. Callers either use
///   [`call`](Self::call) with an error implementing [`BreakerFailure`], or
///   [`call_with`](Self::call_with) and a predicate, or drive a
///   [`BreakerPermit`] by hand.
/// - HalfOpen admits exactly one probe at a time; everyone else is rejected
///   until the probe reports back.
/// - All state sits behind one lock; `state()` and `metrics()` are snapshots.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.refresh(&mut inner);
        inner
    }

    /// Open -> HalfOpen once the timeout has elapsed.
    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.config.timeout())
        {
            inner.enter(CircuitState::HalfOpen);
            info!(breaker = %self.name, "circuit breaker half-open, allowing a probe");
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Ask to make one call.
    ///
    /// Returns `None` when the breaker is open, or half-open with the probe
    /// slot taken. The permit must be settled with one of its `record_*`
    /// methods; dropping it unsettled frees the probe slot without a verdict.
    pub fn acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut inner = self.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.total_rejections += 1;
                return None;
            }
        };
        inner.total_calls += 1;
        Some(BreakerPermit {
            breaker: self,
            generation: inner.generation,
            probe,
            settled: false,
        })
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.enter(CircuitState::Closed);
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    let failures = inner.failure_count;
                    inner.enter(CircuitState::Open);
                    error!(
                        breaker = %self.name,
                        failures,
                        timeout_ms = self.config.timeout_ms,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.enter(CircuitState::Open);
                warn!(breaker = %self.name, "probe failed, circuit breaker re-opened");
            }
            CircuitState::Open => {}
        }
    }

    fn on_release(&self, generation: u64, probe: bool, ignored: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if ignored {
            inner.total_ignored += 1;
        }
        if probe && inner.generation == generation {
            inner.probe_in_flight = false;
        }
    }

    /// Run `op` through the breaker, classifying errors with
    /// [`BreakerFailure`].
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BreakerFailure,
    {
        self.call_with(op, E::counts_as_failure).await
    }

    /// Run `op` through the breaker; `counts` decides which errors trip it.
    ///
    /// Errors for which `counts` is false are returned unchanged but leave
    /// the failure streak alone (a bad payload says nothing about the
    /// remote).
    pub async fn call_with<F, Fut, T, E, P>(&self, op: F, counts: P) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let Some(permit) = self.acquire() else {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        };
        match op().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(e) => {
                if counts(&e) {
                    permit.record_failure();
                } else {
                    permit.record_ignored();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Force the breaker back to Closed and forget the failure streak.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.enter(CircuitState::Closed);
        info!(breaker = %self.name, "circuit breaker reset");
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        let retry_in = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => {
                Some(self.config.timeout().saturating_sub(at.elapsed()))
            }
            _ => None,
        };
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_ignored: inner.total_ignored,
            total_rejections: inner.total_rejections,
            retry_in,
        }
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
#[must_use = "a permit must be settled with record_success/record_failure/record_ignored"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Is this the half-open probe?
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }

    /// The call failed for a reason that says nothing about the remote.
    pub fn record_ignored(mut self) {
        self.settled = true;
        self.breaker.on_release(self.generation, self.probe, true);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.generation, self.probe, false);
        }
    }
}
