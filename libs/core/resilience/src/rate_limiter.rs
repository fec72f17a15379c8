//! Keyed token-bucket rate limiter.
//!
//! Each key (`"email"`, `"tenant-a:sms"`, `"ip:10.0.0.1"`, ...) gets its own
//! bucket on first use. Tokens are refilled lazily from the time elapsed since
//! the previous check, `min(capacity, tokens + elapsed * rate)`, so there is no
//! timer that can drift. A denied request consumes nothing.

use crate::metrics as limiter_metrics;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Burst size and steady refill rate for every bucket of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quota {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Quota {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
        }
    }

    /// `n` requests per second with a burst of `n`.
    pub fn per_second(n: u32) -> Self {
        Self::new(n, f64::from(n))
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    /// Set once the bucket has been removed from the map. A caller holding
    /// a stale handle must look the key up again.
    evicted: bool,
}

impl TokenBucket {
    fn full(quota: &Quota, now: Instant) -> Self {
        Self {
            tokens: f64::from(quota.capacity),
            last_refill: now,
            evicted: false,
        }
    }

    fn refill(&mut self, quota: &Quota, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = f64::from(quota.capacity);
        self.tokens = (self.tokens + elapsed * quota.refill_per_sec).clamp(0.0, capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, quota: &Quota, now: Instant) -> bool {
        self.refill(quota, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_full(&mut self, quota: &Quota, now: Instant) -> bool {
        self.refill(quota, now);
        self.tokens >= f64::from(quota.capacity)
    }
}

/// Admission counters for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub name: String,
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub buckets: usize,
    pub allowed: u64,
    pub denied: u64,
}

/// Per-key token buckets sharing one [`Quota`].
///
/// The bucket map is behind a read-write lock taken for writing only when a
/// key is seen for the first time or during eviction. Each bucket has its own
/// mutex, so checks on different keys never contend.
pub struct RateLimiter {
    name: String,
    quota: Quota,
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("quota", &self.quota)
            .field("buckets", &self.buckets.read().len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, quota: Quota) -> Self {
        Self {
            name: name.into(),
            quota,
            buckets: RwLock::new(HashMap::new()),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Admit or deny one request for `key`, consuming a token only on admit.
    pub fn allow(&self, key: &str) -> bool {
        let allowed = loop {
            if let Some(allowed) = self.take_from(&self.bucket(key)) {
                break allowed;
            }
        };

        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(limiter = %self.name, key, "Rate limit exceeded");
        }
        limiter_metrics::record_decision(&self.name, allowed);
        allowed
    }

    /// Tokens currently available for `key` without consuming any.
    /// Unknown keys report full capacity.
    pub fn available(&self, key: &str) -> u32 {
        let existing = self.buckets.read().get(key).cloned();
        match existing {
            Some(bucket) => {
                let mut bucket = bucket.lock();
                if bucket.evicted {
                    return self.quota.capacity;
                }
                bucket.refill(&self.quota, Instant::now());
                bucket.tokens.floor() as u32
            }
            None => self.quota.capacity,
        }
    }

    /// `None` when the bucket was evicted after the caller looked it up.
    fn take_from(&self, bucket: &Mutex<TokenBucket>) -> Option<bool> {
        let mut bucket = bucket.lock();
        if bucket.evicted {
            return None;
        }
        Some(bucket.try_take(&self.quota, Instant::now()))
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return bucket.clone();
        }

        let mut buckets = self.buckets.write();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::full(&self.quota, Instant::now()))))
            .clone();
        limiter_metrics::set_bucket_count(&self.name, buckets.len());
        bucket
    }

    /// Drop buckets that have refilled to capacity. A dropped key behaves
    /// exactly as before on its next use, since it is recreated full.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let mut bucket = bucket.lock();
            if bucket.is_full(&self.quota, now) {
                bucket.evicted = true;
                false
            } else {
                true
            }
        });
        let evicted = before - buckets.len();
        limiter_metrics::set_bucket_count(&self.name, buckets.len());

        if evicted > 0 {
            tracing::debug!(limiter = %self.name, evicted, remaining = buckets.len(), "Evicted idle rate limit buckets");
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            name: self.name.clone(),
            capacity: self.quota.capacity,
            refill_per_sec: self.quota.refill_per_sec,
            buckets: self.bucket_count(),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }

    /// Run [`Self::evict_idle`] every `every` until `shutdown` flips to true.
    pub fn spawn_eviction(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.evict_idle();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!(limiter = %self.name, "Stopping bucket eviction");
                            break;
                        }
                    }
                }
            }
        })
    }
}
