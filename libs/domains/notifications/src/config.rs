//! Delivery configuration loaded from the environment.

use crate::models::{Channel, Notification, NotificationStatus};
use chrono::{DateTime, Utc};
use core_config::{ConfigError, FromEnv, env_duration_ms, env_duration_secs, env_parse};
use resilience::{CircuitBreakerConfig, Quota};
use std::collections::HashMap;
use std::time::Duration;
use strum::IntoEnumIterator;

/// Per-channel provider deadline and outbound budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSettings {
    pub timeout: Duration,
    pub quota: Quota,
}

impl ChannelSettings {
    pub fn new(timeout: Duration, quota: Quota) -> Self {
        Self { timeout, quota }
    }

    /// SMS and webhooks get short deadlines and tight budgets; push and
    /// in-app tolerate much higher throughput.
    pub fn default_for(channel: Channel) -> Self {
        match channel {
            Channel::Email => Self::new(Duration::from_secs(30), Quota::new(100, 10.0)),
            Channel::Sms => Self::new(Duration::from_secs(10), Quota::new(10, 1.0)),
            Channel::Push => Self::new(Duration::from_secs(30), Quota::new(500, 100.0)),
            Channel::Webhook => Self::new(Duration::from_secs(10), Quota::new(50, 5.0)),
            Channel::InApp => Self::new(Duration::from_secs(5), Quota::new(1000, 200.0)),
        }
    }

    fn from_env(channel: Channel) -> Result<Self, ConfigError> {
        let defaults = Self::default_for(channel);
        let prefix = format!("NOTIFY_{}", channel.as_str().to_uppercase());

        let timeout = env_duration_ms(&format!("{prefix}_TIMEOUT_MS"), defaults.timeout)?;
        let capacity = env_parse(&format!("{prefix}_RATE_CAPACITY"), defaults.quota.capacity)?;
        let rate = env_parse(&format!("{prefix}_RATE_PER_SEC"), defaults.quota.refill_per_sec)?;

        Ok(Self::new(timeout, Quota::new(capacity, rate)))
    }
}

/// Breaker knobs shared by every provider unless overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub max_requests: u32,
    pub interval: Duration,
    pub timeout: Duration,
    /// Trip when consecutive failures exceed this
    pub consecutive_failures: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            consecutive_failures: 5,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_max_requests(self.max_requests)
            .with_interval(self.interval)
            .with_timeout(self.timeout)
            .with_consecutive_failures(self.consecutive_failures)
    }
}

impl FromEnv for BreakerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            max_requests: env_parse("NOTIFY_BREAKER_MAX_REQUESTS", d.max_requests)?,
            interval: env_duration_secs("NOTIFY_BREAKER_INTERVAL_SECS", d.interval)?,
            timeout: env_duration_secs("NOTIFY_BREAKER_TIMEOUT_SECS", d.timeout)?,
            consecutive_failures: env_parse(
                "NOTIFY_BREAKER_CONSECUTIVE_FAILURES",
                d.consecutive_failures,
            )?,
        })
    }
}

/// Delivery engine configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    /// Upper bound on concurrently running delivery attempts
    pub max_concurrency: usize,
    /// Deadline for each store read/write
    pub store_timeout: Duration,
    /// Limiter key is `tenant:channel` when true, `channel` otherwise
    pub per_tenant_limits: bool,
    /// Minimum wait before a failed record is retried. Zero disables it.
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    pub channels: HashMap<Channel, ChannelSettings>,
    pub breaker: BreakerSettings,
    pub breaker_overrides: HashMap<String, BreakerSettings>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_concurrency: 32,
            store_timeout: Duration::from_secs(5),
            per_tenant_limits: true,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(30),
            channels: Channel::iter()
                .map(|c| (c, ChannelSettings::default_for(c)))
                .collect(),
            breaker: BreakerSettings::default(),
            breaker_overrides: HashMap::new(),
        }
    }
}

impl DeliveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_per_tenant_limits(mut self, enabled: bool) -> Self {
        self.per_tenant_limits = enabled;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_backoff_max = max;
        self
    }

    pub fn with_channel(mut self, channel: Channel, settings: ChannelSettings) -> Self {
        self.channels.insert(channel, settings);
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_breaker_override(mut self, provider: impl Into<String>, settings: BreakerSettings) -> Self {
        self.breaker_overrides.insert(provider.into(), settings);
        self
    }

    pub fn channel(&self, channel: Channel) -> ChannelSettings {
        self.channels
            .get(&channel)
            .copied()
            .unwrap_or_else(|| ChannelSettings::default_for(channel))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: self.retry_backoff_base,
            backoff_max: self.retry_backoff_max,
        }
    }

    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        self.retry_policy().backoff(retry_count)
    }
}

/// Retry cap and backoff the retry sweep selects by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before the retry sweep may pick up a record that has failed
    /// `retry_count` times: `base * 2^(retry_count - 1)`, capped.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        if self.backoff_base.is_zero() || retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry_count.saturating_sub(1).min(16));
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    /// Latest `failed_at` at which a record with `retry_count` failures is
    /// ready at `now`. `None` if the backoff is too large to represent.
    pub fn ready_cutoff(&self, retry_count: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.backoff(retry_count))
            .ok()
            .and_then(|backoff| now.checked_sub_signed(backoff))
    }

    /// Whether a record has waited out its backoff. Records that are not
    /// `failed` never back off.
    pub fn backoff_elapsed(&self, notification: &Notification, now: DateTime<Utc>) -> bool {
        if notification.status != NotificationStatus::Failed {
            return true;
        }
        match (notification.failed_at, self.ready_cutoff(notification.retry_count, now)) {
            (None, _) => true,
            (Some(failed_at), Some(cutoff)) => failed_at <= cutoff,
            (Some(_), None) => false,
        }
    }

    /// `failed`, with retries left, and past its backoff at `now`
    pub fn is_retry_ready(&self, notification: &Notification, now: DateTime<Utc>) -> bool {
        notification.status == NotificationStatus::Failed
            && notification.retry_count < self.max_retries
            && self.backoff_elapsed(notification, now)
    }
}

impl FromEnv for DeliveryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();

        let mut channels = HashMap::new();
        for channel in Channel::iter() {
            channels.insert(channel, ChannelSettings::from_env(channel)?);
        }

        Ok(Self {
            max_retries: env_parse("NOTIFY_MAX_RETRIES", d.max_retries)?,
            max_concurrency: env_parse("NOTIFY_MAX_CONCURRENCY", d.max_concurrency)?.max(1),
            store_timeout: env_duration_ms("NOTIFY_STORE_TIMEOUT_MS", d.store_timeout)?,
            per_tenant_limits: env_parse("NOTIFY_PER_TENANT_LIMITS", d.per_tenant_limits)?,
            retry_backoff_base: env_duration_ms("NOTIFY_RETRY_BACKOFF_BASE_MS", d.retry_backoff_base)?,
            retry_backoff_max: env_duration_ms("NOTIFY_RETRY_BACKOFF_MAX_MS", d.retry_backoff_max)?,
            channels,
            breaker: BreakerSettings::from_env()?,
            breaker_overrides: HashMap::new(),
        })
    }
}

/// Periodic sweep configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    pub pending_batch: u64,
    pub retry_batch: u64,
    pub limiter_eviction_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pending_batch: 100,
            retry_batch: 50,
            limiter_eviction_interval: Duration::from_secs(300),
        }
    }
}

impl SweepConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batches(mut self, pending: u64, retry: u64) -> Self {
        self.pending_batch = pending;
        self.retry_batch = retry;
        self
    }
}

impl FromEnv for SweepConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            interval: env_duration_secs("NOTIFY_SWEEP_INTERVAL_SECS", d.interval)?,
            pending_batch: env_parse("NOTIFY_PENDING_BATCH", d.pending_batch)?,
            retry_batch: env_parse("NOTIFY_RETRY_BATCH", d.retry_batch)?,
            limiter_eviction_interval: env_duration_secs(
                "NOTIFY_LIMITER_EVICT_SECS",
                d.limiter_eviction_interval,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_channel_budgets_differ() {
        let config = DeliveryConfig::default();
        let sms = config.channel(Channel::Sms);
        let push = config.channel(Channel::Push);

        assert!(push.quota.refill_per_sec > sms.quota.refill_per_sec);
        assert!(sms.timeout < push.timeout);
        assert_eq!(config.channels.len(), 5);
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let config = DeliveryConfig::default()
            .with_retry_backoff(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(config.retry_backoff(0), Duration::ZERO);
        assert_eq!(config.retry_backoff(1), Duration::from_secs(1));
        assert_eq!(config.retry_backoff(2), Duration::from_secs(2));
        assert_eq!(config.retry_backoff(3), Duration::from_secs(4));
        assert_eq!(config.retry_backoff(4), Duration::from_secs(5));
        assert_eq!(config.retry_backoff(40), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_readiness() {
        let policy = DeliveryConfig::default()
            .with_retry_backoff(Duration::from_secs(60), Duration::from_secs(600))
            .retry_policy();
        let now = Utc::now();
        let mut n = Notification::new(
            crate::models::CreateNotification::new("t", Channel::Email, "a@example.com", "hi"),
            now,
        );
        assert!(!policy.is_retry_ready(&n, now));

        n.mark_failed(now, "503", 3).unwrap();
        assert!(!policy.is_retry_ready(&n, now + chrono::Duration::seconds(59)));
        assert!(policy.is_retry_ready(&n, now + chrono::Duration::seconds(60)));

        n.mark_failed(now, "503", 3).unwrap();
        assert!(!policy.is_retry_ready(&n, now + chrono::Duration::seconds(60)));
        assert!(policy.is_retry_ready(&n, now + chrono::Duration::seconds(120)));

        n.mark_failed(now, "503", 3).unwrap();
        assert!(!policy.is_retry_ready(&n, now + chrono::Duration::days(1)));
    }

    #[test]
    fn test_zero_backoff_base_disables_gating() {
        let config = DeliveryConfig::default().with_retry_backoff(Duration::ZERO, Duration::ZERO);
        assert_eq!(config.retry_backoff(3), Duration::ZERO);
    }

    #[test]
    fn test_delivery_config_from_env_defaults() {
        temp_env::with_vars_unset(
            [
                "NOTIFY_MAX_RETRIES",
                "NOTIFY_MAX_CONCURRENCY",
                "NOTIFY_SMS_TIMEOUT_MS",
                "NOTIFY_BREAKER_CONSECUTIVE_FAILURES",
            ],
            || {
                let config = DeliveryConfig::from_env().unwrap();
                assert_eq!(config.max_retries, 3);
                assert_eq!(config.max_concurrency, 32);
                assert_eq!(config.channel(Channel::Sms).timeout, Duration::from_secs(10));
                assert_eq!(config.breaker.consecutive_failures, 5);
            },
        );
    }

    #[test]
    fn test_delivery_config_from_env_overrides() {
        temp_env::with_vars(
            [
                ("NOTIFY_MAX_RETRIES", Some("5")),
                ("NOTIFY_PER_TENANT_LIMITS", Some("false")),
                ("NOTIFY_IN_APP_RATE_CAPACITY", Some("7")),
                ("NOTIFY_WEBHOOK_TIMEOUT_MS", Some("1500")),
                ("NOTIFY_BREAKER_TIMEOUT_SECS", Some("5")),
            ],
            || {
                let config = DeliveryConfig::from_env().unwrap();
                assert_eq!(config.max_retries, 5);
                assert!(!config.per_tenant_limits);
                assert_eq!(config.channel(Channel::InApp).quota.capacity, 7);
                assert_eq!(
                    config.channel(Channel::Webhook).timeout,
                    Duration::from_millis(1500)
                );
                assert_eq!(config.breaker.timeout, Duration::from_secs(5));
            },
        );
    }

    #[test]
    fn test_delivery_config_from_env_invalid() {
        temp_env::with_var("NOTIFY_SMS_RATE_PER_SEC", Some("fast"), || {
            let err = DeliveryConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("NOTIFY_SMS_RATE_PER_SEC"));
        });
    }

    #[test]
    fn test_sweep_config_from_env() {
        temp_env::with_vars(
            [
                ("NOTIFY_SWEEP_INTERVAL_SECS", Some("10")),
                ("NOTIFY_PENDING_BATCH", None),
                ("NOTIFY_RETRY_BATCH", Some("5")),
            ],
            || {
                let config = SweepConfig::from_env().unwrap();
                assert_eq!(config.interval, Duration::from_secs(10));
                assert_eq!(config.pending_batch, 100);
                assert_eq!(config.retry_batch, 5);
            },
        );
    }

    #[test]
    fn test_breaker_settings_build_config() {
        let breaker = BreakerSettings {
            max_requests: 3,
            ..Default::default()
        }
        .to_breaker_config();
        assert_eq!(breaker.max_requests, 3);
        assert_eq!(breaker.timeout, Duration::from_secs(60));
    }
}
