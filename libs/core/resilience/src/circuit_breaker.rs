//! Circuit breaker for a single logical provider.
//!
//! ```text
//! ┌─────────┐  ready_to_trip(counts)  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │ <──┐
//! └─────────┘                         └────────┘    │
//!      ^                                   │        │
//!      │                                   │ timeout elapsed
//!      │ max_requests consecutive          v        │ any failure
//!      │ successes               ┌─────────────┐    │
//!      └──────────────────────── │  HALF-OPEN  │ ───┘
//!                                └─────────────┘
//! ```
//!
//! Every state change starts a new *generation*: counts are cleared and the
//! expiry is recomputed. Outcomes are recorded against the generation that
//! admitted the request; an outcome arriving after the generation moved on is
//! dropped.
//!
//! Transitions are lazy. There is no background timer; the state is brought
//! up to date from the clock whenever the breaker is consulted.
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::new("sendgrid", CircuitBreakerConfig::default());
//!
//! match breaker.call(|| provider.send(&message)).await {
//!     Ok(receipt) => { /* delivered */ }
//!     Err(BreakerError::Open(_)) => { /* failed fast, provider not called */ }
//!     Err(e) => { /* provider error */ }
//! }
//! ```

use crate::error::BreakerError;
use crate::metrics as breaker_metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without calling the provider.
    Open,
    /// A limited number of probe requests are let through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding used for the state gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request and outcome counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Decides whether a failure in the closed state opens the breaker.
pub type TripPredicate = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Invoked with `(name, from, to)` on every state change, inside the breaker lock.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Configuration for a circuit breaker.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Probe requests admitted while half-open, and consecutive successes
    /// needed to close again. Zero is treated as one.
    pub max_requests: u32,
    /// Closed-state window after which counts are cleared. Zero disables the
    /// periodic reset.
    pub interval: Duration,
    /// How long the breaker stays open before admitting probes.
    pub timeout: Duration,
    pub ready_to_trip: TripPredicate,
    pub on_state_change: Option<StateChangeHook>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            ready_to_trip: trip_after_consecutive_failures(5),
            on_state_change: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish_non_exhaustive()
    }
}

/// Trip once consecutive failures exceed `threshold`.
pub fn trip_after_consecutive_failures(threshold: u32) -> TripPredicate {
    Arc::new(move |counts: &Counts| counts.consecutive_failures > threshold)
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the trip predicate with "more than `threshold` consecutive failures".
    pub fn with_consecutive_failures(mut self, threshold: u32) -> Self {
        self.ready_to_trip = trip_after_consecutive_failures(threshold);
        self
    }

    pub fn with_ready_to_trip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Arc::new(predicate);
        self
    }

    pub fn with_on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    fn effective_max_requests(&self) -> u32 {
        self.max_requests.max(1)
    }
}

/// Point-in-time view of a breaker for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub generation: u64,
    pub counts: Counts,
}

struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Thread-safe circuit breaker. All bookkeeping is serialized by one mutex
/// per breaker; the wrapped call itself runs outside the lock.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("counts", &inner.counts)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        let mut inner = Inner {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
        };
        inner.expiry = closed_expiry(&config, now);

        let breaker = Self {
            name: name.into(),
            config,
            inner: Mutex::new(inner),
        };
        breaker_metrics::set_breaker_state(&breaker.name, CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying any transition the clock has made due.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now()).0
    }

    /// Counts for the current generation.
    pub fn counts(&self) -> Counts {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now());
        inner.counts
    }

    pub fn generation(&self) -> u64 {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now()).1
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        let (state, generation) = self.current_state(&mut inner, Instant::now());
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            generation,
            counts: inner.counts,
        }
    }

    /// Force the breaker closed with fresh counts. Outcomes of requests
    /// admitted before the reset are discarded.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.state == CircuitState::Closed {
            self.new_generation(&mut inner, now);
        } else {
            self.set_state(&mut inner, CircuitState::Closed, now);
        }
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    /// Run `f` if the breaker admits it. Every error from `f` counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Run `f` if the breaker admits it. Errors for which `is_failure` returns
    /// false are recorded as successes: the dependency answered, the request
    /// was at fault.
    ///
    /// If the returned future is dropped before `f` completes, the request is
    /// recorded as a failure.
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        f: F,
        is_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let generation = self.before_request::<E>()?;
        let mut guard = InFlight {
            breaker: self,
            generation,
            recorded: false,
        };

        let result = f().await;
        let success = match &result {
            Ok(_) => true,
            Err(e) => !is_failure(e),
        };
        guard.record(success);

        result.map_err(BreakerError::Inner)
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut inner = self.inner.lock();
        let (state, generation) = self.current_state(&mut inner, Instant::now());

        match state {
            CircuitState::Open => return Err(BreakerError::Open(self.name.clone())),
            CircuitState::HalfOpen
                if inner.counts.requests >= self.config.effective_max_requests() =>
            {
                return Err(BreakerError::TooManyRequests(self.name.clone()));
            }
            _ => {}
        }

        inner.counts.on_request();
        Ok(generation)
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let (state, generation) = self.current_state(&mut inner, now);
        if generation != before {
            tracing::trace!(
                breaker = %self.name,
                started = before,
                current = generation,
                "Discarding outcome from a previous generation"
            );
            return;
        }

        if success {
            self.on_success(&mut inner, state, now);
        } else {
            self.on_failure(&mut inner, state, now);
        }
    }

    fn on_success(&self, inner: &mut Inner, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.effective_max_requests() {
                    self.set_state(inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if (self.config.ready_to_trip)(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    fn current_state(&self, inner: &mut Inner, now: Instant) -> (CircuitState, u64) {
        let expired = matches!(inner.expiry, Some(expiry) if expiry <= now);
        match inner.state {
            CircuitState::Closed if expired => self.new_generation(inner, now),
            CircuitState::Open if expired => self.set_state(inner, CircuitState::HalfOpen, now),
            _ => {}
        }
        (inner.state, inner.generation)
    }

    fn set_state(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);

        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                from = %from,
                generation = inner.generation,
                "Circuit breaker OPENED"
            ),
            CircuitState::HalfOpen => tracing::info!(
                breaker = %self.name,
                generation = inner.generation,
                "Circuit breaker HALF-OPEN (probing recovery)"
            ),
            CircuitState::Closed => tracing::info!(
                breaker = %self.name,
                from = %from,
                generation = inner.generation,
                "Circuit breaker CLOSED"
            ),
        }
        breaker_metrics::record_transition(&self.name, to);

        if let Some(hook) = &self.config.on_state_change {
            hook(&self.name, from, to);
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts.clear();
        inner.expiry = match inner.state {
            CircuitState::Closed => closed_expiry(&self.config, now),
            CircuitState::Open => Some(now + self.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

fn closed_expiry(config: &CircuitBreakerConfig, now: Instant) -> Option<Instant> {
    if config.interval.is_zero() {
        None
    } else {
        Some(now + config.interval)
    }
}

/// Records the outcome of an admitted request exactly once. A request that
/// never reports (its future was dropped) is recorded as a failure.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    recorded: bool,
}

impl InFlight<'_> {
    fn record(&mut self, success: bool) {
        if !self.recorded {
            self.recorded = true;
            self.breaker.after_request(self.generation, success);
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.record(false);
    }
}
