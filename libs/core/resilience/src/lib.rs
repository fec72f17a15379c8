//! Failure isolation and admission control for outbound provider calls.
//!
//! - [`CircuitBreaker`]: generation-tracked closed / open / half-open state
//!   machine with lazy, clock-driven transitions.
//! - [`BreakerRegistry`]: one breaker per provider, created on first use, with
//!   per-provider configuration overrides and operational reset.
//! - [`RateLimiter`]: per-key token buckets refilled lazily from elapsed time.
//!
//! All clocks are [`tokio::time::Instant`], so tests drive time with
//! `tokio::time::pause` / `advance`.

pub mod circuit_breaker;
pub mod error;
pub mod metrics;
pub mod rate_limiter;
pub mod registry;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, Counts,
};
pub use error::BreakerError;
pub use rate_limiter::{LimiterStats, Quota, RateLimiter};
pub use registry::BreakerRegistry;
