//! Delivery engine.
//!
//! The engine is the only writer of notification records and the only caller
//! of channel providers. Each attempt goes through the same pipeline:
//!
//! ```text
//! claim id ─> re-read record ─> eligible? ─> limiter.allow(key)
//!                                                  │
//!              persist once <─ mark sent/failed <─ breaker.call(timeout(provider.send))
//!                   │
//!                   └─> publish lifecycle event
//! ```
//!
//! Dispatches run as tracked tokio tasks, bounded by a semaphore shared
//! between immediate dispatch and the sweeps.

use crate::clock::{Clock, SystemClock};
use crate::config::DeliveryConfig;
use crate::error::{NotificationError, NotificationResult};
use crate::events::{self, EventPublisher};
use crate::metrics::{self as delivery_metrics, AttemptOutcome};
use crate::models::{Channel, CreateNotification, Notification, NotificationStats};
use crate::providers::{OutboundMessage, ProviderSet, Receipt};
use crate::repository::{NotificationRepository, Revision};
use crate::validation::validate_request;
use parking_lot::Mutex;
use resilience::{BreakerError, BreakerRegistry, BreakerSnapshot, LimiterStats, RateLimiter};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why an attempt did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another task is already attempting this record
    InFlight,
    NotFound,
    /// Status or schedule no longer allows an attempt
    NotEligible,
    /// Failed too recently for the retry backoff
    BackingOff,
}

/// Result of [`DeliveryEngine::process_notification`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Failed { retry_count: u32, error: String },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub selected: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Attempts abandoned on a store error
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &NotificationResult<DispatchOutcome>) {
        match outcome {
            Ok(DispatchOutcome::Sent) => self.sent += 1,
            Ok(DispatchOutcome::Failed { .. }) => self.failed += 1,
            Ok(DispatchOutcome::Skipped(_)) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Releases an in-flight claim when the attempt ends or is cancelled.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

/// Dispatched tasks that have not finished yet.
#[derive(Default)]
struct ActiveTasks {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveTasks {
    fn start(self: &Arc<Self>) -> ActiveTask {
        self.count.fetch_add(1, Ordering::SeqCst);
        ActiveTask(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

struct ActiveTask(Arc<ActiveTasks>);

impl Drop for ActiveTask {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct DeliveryEngine {
    repository: Arc<dyn NotificationRepository>,
    publisher: Arc<dyn EventPublisher>,
    providers: ProviderSet,
    breakers: BreakerRegistry,
    limiters: HashMap<Channel, Arc<RateLimiter>>,
    config: DeliveryConfig,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    active: Arc<ActiveTasks>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl DeliveryEngine {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        publisher: Arc<dyn EventPublisher>,
        providers: ProviderSet,
        config: DeliveryConfig,
    ) -> Self {
        let mut breakers = BreakerRegistry::new(config.breaker.to_breaker_config());
        for (provider, settings) in &config.breaker_overrides {
            breakers = breakers.with_override(provider.clone(), settings.to_breaker_config());
        }
        // Register a breaker for every configured provider so the admin view
        // lists them before their first attempt.
        for channel in providers.channels() {
            if let Some(provider) = providers.get(channel) {
                breakers.get(provider.name());
            }
        }

        let limiters = Channel::iter()
            .map(|channel| {
                let quota = config.channel(channel).quota;
                (channel, Arc::new(RateLimiter::new(channel.as_str(), quota)))
            })
            .collect();

        Self {
            repository,
            publisher,
            providers,
            breakers,
            limiters,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            clock: Arc::new(SystemClock),
            tracker: TaskTracker::new(),
            active: Arc::new(ActiveTasks::default()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn limiter(&self, channel: Channel) -> Option<&Arc<RateLimiter>> {
        self.limiters.get(&channel)
    }

    /// Validate and persist a new notification, then dispatch it right away
    /// unless it is scheduled for later.
    ///
    /// Only validation and store errors are returned; the outcome of the
    /// delivery attempt is recorded on the notification.
    pub async fn submit(self: &Arc<Self>, input: CreateNotification) -> NotificationResult<Notification> {
        validate_request(&input)?;

        let now = self.clock.now();
        let notification = Notification::new(input, now);
        self.with_store_timeout("create", self.repository.create(&notification))
            .await?;

        info!(
            notification_id = %notification.id,
            tenant_id = %notification.tenant_id,
            channel = %notification.channel,
            priority = %notification.priority,
            scheduled_for = ?notification.scheduled_for,
            "Notification accepted"
        );
        delivery_metrics::record_submitted(notification.channel);
        self.publish(events::NOTIFICATION_CREATED, &notification).await;

        if notification.is_due(now) {
            self.dispatch(notification.id);
        }
        Ok(notification)
    }

    /// Spawn an attempt for `id` on the bounded pool. Returns false once the
    /// engine is shutting down.
    pub fn dispatch(self: &Arc<Self>, id: Uuid) -> bool {
        if self.tracker.is_closed() {
            debug!(notification_id = %id, "Engine shutting down, dispatch dropped");
            return false;
        }

        let engine = Arc::clone(self);
        let active = self.active.start();
        self.tracker.spawn(async move {
            let _active = active;
            let Ok(_permit) = engine.permits.clone().acquire_owned().await else {
                return;
            };
            if let Err(e) = engine.process_notification(id).await {
                warn!(notification_id = %id, error = %e, "Delivery attempt abandoned");
            }
        });
        true
    }

    /// Run one delivery attempt against the current persisted state of `id`.
    ///
    /// A store error before the attempt abandons it without touching the
    /// breaker or the limiter. A store error after the attempt is returned
    /// and the record keeps its previous state.
    pub async fn process_notification(&self, id: Uuid) -> NotificationResult<DispatchOutcome> {
        let Some(_claim) = self.claim(id) else {
            debug!(notification_id = %id, "Attempt already in flight");
            return Ok(DispatchOutcome::Skipped(SkipReason::InFlight));
        };

        let Some(mut notification) = self
            .with_store_timeout("get_by_id", self.repository.get_by_id(id))
            .await?
        else {
            return Ok(DispatchOutcome::Skipped(SkipReason::NotFound));
        };

        let now = self.clock.now();
        let expected = Revision::of(&notification);
        if !notification.is_dispatchable(now, self.config.max_retries) {
            debug!(
                notification_id = %id,
                status = %notification.status,
                retry_count = notification.retry_count,
                "Notification not eligible for delivery"
            );
            return Ok(DispatchOutcome::Skipped(SkipReason::NotEligible));
        }
        if !self.config.retry_policy().backoff_elapsed(&notification, now) {
            return Ok(DispatchOutcome::Skipped(SkipReason::BackingOff));
        }

        let started = Instant::now();
        let result = self.attempt(&notification).await;
        let finished_at = self.clock.now();

        let (outcome, topic) = match result {
            Ok(receipt) => {
                notification.mark_sent(finished_at)?;
                info!(
                    notification_id = %id,
                    channel = %notification.channel,
                    message_id = ?receipt.message_id,
                    "Notification sent"
                );
                delivery_metrics::record_attempt(notification.channel, AttemptOutcome::Sent, started.elapsed());
                (DispatchOutcome::Sent, events::NOTIFICATION_SENT)
            }
            Err(e) => {
                notification.mark_failed(finished_at, e.to_string(), self.config.max_retries)?;
                let exhausted = notification.is_exhausted(self.config.max_retries);
                warn!(
                    notification_id = %id,
                    channel = %notification.channel,
                    retry_count = notification.retry_count,
                    exhausted,
                    error = %e,
                    "Notification delivery failed"
                );
                delivery_metrics::record_attempt(notification.channel, attempt_outcome(&e), started.elapsed());
                (
                    DispatchOutcome::Failed {
                        retry_count: notification.retry_count,
                        error: e.to_string(),
                    },
                    events::NOTIFICATION_FAILED,
                )
            }
        };

        if let Err(e) = self
            .with_store_timeout("update", self.repository.update(&notification, expected))
            .await
        {
            if matches!(e, NotificationError::Conflict(_)) {
                warn!(notification_id = %id, "Delivery outcome discarded, record changed by another writer");
            } else {
                error!(notification_id = %id, error = %e, "Failed to persist delivery outcome");
            }
            return Err(e);
        }

        self.publish(topic, &notification).await;
        Ok(outcome)
    }

    async fn attempt(&self, notification: &Notification) -> NotificationResult<Receipt> {
        let provider = self.providers.get(notification.channel).ok_or_else(|| {
            NotificationError::Config(format!(
                "no provider configured for channel '{}'",
                notification.channel
            ))
        })?;

        let key = self.limiter_key(notification);
        if let Some(limiter) = self.limiters.get(&notification.channel) {
            if !limiter.allow(&key) {
                return Err(NotificationError::RateLimitExceeded(key));
            }
        }

        let breaker = self.breakers.get(provider.name());
        let timeout = self.config.channel(notification.channel).timeout;
        let message = OutboundMessage::from(notification);
        let provider = provider.as_ref();
        let message = &message;

        let result = breaker
            .call_classified(
                move || async move {
                    match tokio::time::timeout(timeout, provider.send(message)).await {
                        Ok(Ok(receipt)) => Ok(receipt),
                        Ok(Err(e)) => Err(e.into_notification_error(provider.name())),
                        Err(_) => Err(NotificationError::Timeout {
                            operation: format!("{} send", provider.name()),
                            millis: duration_millis(timeout),
                        }),
                    }
                },
                |e: &NotificationError| e.counts_as_breaker_failure(),
            )
            .await;

        result.map_err(|e| match e {
            BreakerError::Open(name) => NotificationError::CircuitOpen(name),
            BreakerError::TooManyRequests(name) => NotificationError::TooManyRequests(name),
            BreakerError::Inner(e) => e,
        })
    }

    fn limiter_key(&self, notification: &Notification) -> String {
        if self.config.per_tenant_limits {
            format!("{}:{}", notification.tenant_id, notification.channel)
        } else {
            notification.channel.to_string()
        }
    }

    fn claim(&self, id: Uuid) -> Option<Claim<'_>> {
        if self.in_flight.lock().insert(id) {
            Some(Claim {
                in_flight: &self.in_flight,
                id,
            })
        } else {
            None
        }
    }

    /// Number of records with an attempt currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Dispatch every `pending` record that is due, up to `limit`.
    pub async fn sweep_pending(self: &Arc<Self>, limit: u64) -> NotificationResult<SweepReport> {
        let now = self.clock.now();
        let batch = self
            .with_store_timeout("get_pending", self.repository.get_pending(now, limit))
            .await?;
        delivery_metrics::record_sweep_selected("pending", batch.len());
        let report = self.run_batch(batch).await;
        if report.selected > 0 {
            info!(sweep = "pending", ?report, "Sweep finished");
        }
        Ok(report)
    }

    /// Re-attempt `failed` records that have retries left and have waited
    /// out their backoff, up to `limit`.
    pub async fn sweep_retries(self: &Arc<Self>, limit: u64) -> NotificationResult<SweepReport> {
        let now = self.clock.now();
        let batch = self
            .with_store_timeout(
                "get_failed_retryable",
                self.repository
                    .get_failed_retryable(self.config.retry_policy(), now, limit),
            )
            .await?;
        delivery_metrics::record_sweep_selected("retry", batch.len());
        let report = self.run_batch(batch).await;
        if report.selected > 0 {
            info!(sweep = "retry", ?report, "Sweep finished");
        }
        Ok(report)
    }

    async fn run_batch(self: &Arc<Self>, batch: Vec<Notification>) -> SweepReport {
        let mut report = SweepReport {
            selected: batch.len(),
            ..Default::default()
        };
        let mut tasks = JoinSet::new();

        for notification in batch {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                report.skipped += 1;
                continue;
            };
            let engine = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                engine.process_notification(notification.id).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Err(e) = &outcome {
                        warn!(error = %e, "Sweep attempt abandoned");
                    }
                    report.record(&outcome);
                }
                Err(e) => {
                    error!(error = %e, "Sweep task panicked");
                    report.errors += 1;
                }
            }
        }
        report
    }

    pub async fn get(&self, id: Uuid) -> NotificationResult<Notification> {
        self.with_store_timeout("get_by_id", self.repository.get_by_id(id))
            .await?
            .ok_or(NotificationError::NotFound(id))
    }

    /// Channel acknowledgement of a `sent` record.
    pub async fn mark_delivered(&self, id: Uuid) -> NotificationResult<Notification> {
        let mut notification = self.get(id).await?;
        let expected = Revision::of(&notification);
        notification.mark_delivered(self.clock.now())?;
        self.with_store_timeout("update", self.repository.update(&notification, expected))
            .await?;
        self.publish(events::NOTIFICATION_DELIVERED, &notification).await;
        Ok(notification)
    }

    /// Consumer acknowledgement of a `sent` or `delivered` record.
    pub async fn mark_read(&self, id: Uuid) -> NotificationResult<Notification> {
        let mut notification = self.get(id).await?;
        let expected = Revision::of(&notification);
        notification.mark_read(self.clock.now())?;
        self.with_store_timeout("update", self.repository.update(&notification, expected))
            .await?;
        self.publish(events::NOTIFICATION_READ, &notification).await;
        Ok(notification)
    }

    pub async fn stats(&self, tenant_id: Option<&str>) -> NotificationResult<NotificationStats> {
        self.with_store_timeout(
            "stats",
            self.repository
                .stats(tenant_id.map(str::to_string), self.config.max_retries),
        )
        .await
    }

    pub fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }

    pub fn reset_breaker(&self, provider: &str) -> bool {
        self.breakers.reset(provider)
    }

    pub fn reset_breakers(&self) -> usize {
        self.breakers.reset_all()
    }

    /// Limiter counters, sorted by channel
    pub fn limiter_stats(&self) -> Vec<LimiterStats> {
        let mut stats: Vec<LimiterStats> = self.limiters.values().map(|l| l.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Start idle-bucket eviction on every channel limiter.
    pub fn spawn_limiter_eviction(
        &self,
        every: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.limiters
            .values()
            .map(|limiter| Arc::clone(limiter).spawn_eviction(every, shutdown.clone()))
            .collect()
    }

    /// Wait until no dispatched attempt is running.
    pub async fn wait_idle(&self) {
        self.active.wait_idle().await;
    }

    /// Stop accepting dispatches and wait for the running ones.
    pub async fn shutdown(&self) {
        self.tracker.close();
        info!(running = self.tracker.len(), "Draining delivery tasks");
        self.tracker.wait().await;
        info!("Delivery engine stopped");
    }

    async fn with_store_timeout<T>(
        &self,
        operation: &str,
        call: impl Future<Output = NotificationResult<T>>,
    ) -> NotificationResult<T> {
        let limit = self.config.store_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| NotificationError::Timeout {
                operation: format!("store {}", operation),
                millis: duration_millis(limit),
            })?
    }

    async fn publish(&self, topic: &str, notification: &Notification) {
        let payload = events::event_payload(notification);
        if let Err(e) = self.publisher.publish(topic, &payload).await {
            warn!(topic, notification_id = %notification.id, error = %e, "Failed to publish lifecycle event");
        }
    }
}

fn attempt_outcome(error: &NotificationError) -> AttemptOutcome {
    match error {
        NotificationError::RateLimitExceeded(_) => AttemptOutcome::RateLimited,
        NotificationError::CircuitOpen(_) | NotificationError::TooManyRequests(_) => {
            AttemptOutcome::CircuitOpen
        }
        _ => AttemptOutcome::Failed,
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
