//! Resilience gates around the remote call: a circuit breaker and a rate
//! limiter. Both keep their own counters behind their own lock.

mod circuit_breaker;
mod rate_limiter;

pub use circuit_breaker::{
    BreakerFailure, BreakerMetrics, BreakerPermit, CircuitBreaker, CircuitState,
};
pub use rate_limiter::{LimiterStats, RateLimiter};
