//! Data models for the notifications domain.

use crate::error::{NotificationError, NotificationResult};
use crate::validation::validate_create;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;
use validator::Validate;

/// Delivery medium. Decides which provider is used and how the recipient is validated.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
    Webhook,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Ordering hint for sweeps. Not a scheduling guarantee.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank, higher is swept first
    pub fn rank(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

/// Lifecycle status.
///
/// ```text
/// pending ──> sent ──> delivered ──> read
///    │         ^           │
///    │         │           └──────────> read
///    v         │
/// failed ──────┘   (re-attempted while retry_count < max)
///    └──> failed
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl NotificationStatus {
    /// Allowed transitions. A retryable `failed` record is re-admitted and
    /// attempted again, so `failed -> sent` and `failed -> failed` are valid.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Failed, Pending)
                | (Failed, Sent)
                | (Failed, Failed)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Delivered, Read)
        )
    }
}

/// One deliverable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub channel: Channel,
    pub priority: Priority,
    pub subject: String,
    pub message: String,
    pub recipient: String,
    pub metadata: BTreeMap<String, String>,
    pub status: NotificationStatus,
    pub retry_count: u32,
    /// Last failure reason, kept across retries
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Build a fresh `pending` record from a validated request
    pub fn new(input: CreateNotification, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id: input.tenant_id,
            user_id: input.user_id,
            channel: input.channel,
            priority: input.priority,
            subject: input.subject,
            message: input.message,
            recipient: input.recipient.trim().to_string(),
            metadata: input.metadata,
            status: NotificationStatus::Pending,
            retry_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
            scheduled_for: input.scheduled_for,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
        }
    }

    /// No future delivery gate
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_none_or(|at| at <= now)
    }

    /// Whether a delivery attempt may run against this record right now.
    pub fn is_dispatchable(&self, now: DateTime<Utc>, max_retries: u32) -> bool {
        match self.status {
            NotificationStatus::Pending => self.is_due(now),
            NotificationStatus::Failed => self.retry_count < max_retries,
            _ => false,
        }
    }

    /// Failed with no retries left
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.status == NotificationStatus::Failed && self.retry_count >= max_retries
    }

    fn ensure_transition(&self, next: NotificationStatus) -> NotificationResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(NotificationError::InvalidTransition(format!(
                "{} -> {} for notification {}",
                self.status, next, self.id
            )))
        }
    }

    /// Successful attempt
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> NotificationResult<()> {
        self.ensure_transition(NotificationStatus::Sent)?;
        self.status = NotificationStatus::Sent;
        self.sent_at = Some(now);
        self.failed_at = None;
        self.error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Failed attempt. Spends one retry, never beyond `max_retries`.
    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        reason: impl Into<String>,
        max_retries: u32,
    ) -> NotificationResult<()> {
        self.ensure_transition(NotificationStatus::Failed)?;
        self.status = NotificationStatus::Failed;
        self.retry_count = self.retry_count.saturating_add(1).min(max_retries);
        self.error = Some(reason.into());
        self.failed_at = Some(now);
        self.sent_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) -> NotificationResult<()> {
        self.ensure_transition(NotificationStatus::Delivered)?;
        self.status = NotificationStatus::Delivered;
        self.delivered_at = Some(now.max(self.sent_at.unwrap_or(now)));
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_read(&mut self, now: DateTime<Utc>) -> NotificationResult<()> {
        if self.status == NotificationStatus::Read {
            return Err(NotificationError::InvalidTransition(format!(
                "notification {} is already read",
                self.id
            )));
        }
        self.ensure_transition(NotificationStatus::Read)?;
        let floor = self.delivered_at.or(self.sent_at).unwrap_or(now);
        self.status = NotificationStatus::Read;
        self.read_at = Some(now.max(floor));
        self.updated_at = now;
        Ok(())
    }
}

/// Submission request.
///
/// Field presence is checked by the derive; the recipient format depends on
/// the channel and is checked by [`crate::validation::validate_recipient`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_create"))]
pub struct CreateNotification {
    #[validate(length(min = 1, max = 128))]
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub channel: Channel,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    #[validate(length(max = 998))]
    pub subject: String,
    #[validate(length(min = 1))]
    pub message: String,
    #[validate(length(min = 1))]
    pub recipient: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl CreateNotification {
    pub fn new(
        tenant_id: impl Into<String>,
        channel: Channel,
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
            channel,
            priority: Priority::default(),
            subject: String::new(),
            message: message.into(),
            recipient: recipient.into(),
            metadata: BTreeMap::new(),
            scheduled_for: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}

/// Counts per status, optionally scoped to a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStats {
    pub total: u64,
    pub pending: u64,
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
    /// `failed` records with no retries left
    pub exhausted: u64,
}

impl NotificationStats {
    pub fn record(&mut self, notification: &Notification, max_retries: u32) {
        self.total += 1;
        match notification.status {
            NotificationStatus::Pending => self.pending += 1,
            NotificationStatus::Sent => self.sent += 1,
            NotificationStatus::Delivered => self.delivered += 1,
            NotificationStatus::Read => self.read += 1,
            NotificationStatus::Failed => {
                self.failed += 1;
                if notification.retry_count >= max_retries {
                    self.exhausted += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::str::FromStr;

    fn pending() -> Notification {
        Notification::new(
            CreateNotification::new("tenant-a", Channel::Email, "a@example.com", "hello"),
            Utc::now(),
        )
    }

    #[test]
    fn test_channel_string_forms() {
        assert_eq!(Channel::InApp.to_string(), "in_app");
        assert_eq!(Channel::InApp.as_str(), "in_app");
        assert_eq!(Channel::from_str("webhook").unwrap(), Channel::Webhook);
        assert_eq!(serde_json::to_string(&Channel::Sms).unwrap(), "\"sms\"");
    }

    #[test]
    fn test_new_record_stores_trimmed_recipient() {
        let n = Notification::new(
            CreateNotification::new("tenant-a", Channel::Email, "  a@example.com\n", "hello"),
            Utc::now(),
        );
        assert_eq!(n.recipient, "a@example.com");
    }

    #[test]
    fn test_priority_rank_orders_critical_first() {
        assert!(Priority::Critical.rank() > Priority::High.rank());
        assert!(Priority::High.rank() > Priority::Normal.rank());
        assert!(Priority::Normal.rank() > Priority::Low.rank());
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_failed_then_sent_keeps_exactly_one_outcome_timestamp() {
        let mut n = pending();
        let now = Utc::now();

        n.mark_failed(now, "smtp down", 3).unwrap();
        assert_eq!(n.status, NotificationStatus::Failed);
        assert_eq!(n.retry_count, 1);
        assert!(n.failed_at.is_some() && n.sent_at.is_none());

        n.mark_sent(now + Duration::seconds(5)).unwrap();
        assert_eq!(n.status, NotificationStatus::Sent);
        assert!(n.sent_at.is_some() && n.failed_at.is_none());
        assert!(n.error.is_none());
        assert_eq!(n.retry_count, 1);
    }

    #[test]
    fn test_retry_count_is_capped() {
        let mut n = pending();
        let now = Utc::now();
        for _ in 0..5 {
            n.mark_failed(now, "boom", 3).unwrap();
        }
        assert_eq!(n.retry_count, 3);
        assert!(n.is_exhausted(3));
        assert!(!n.is_dispatchable(now, 3));
        assert_eq!(n.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_scheduled_record_is_not_due_early() {
        let now = Utc::now();
        let n = Notification::new(
            CreateNotification::new("t", Channel::Push, "device-token-0123456789", "hi")
                .scheduled_for(now + Duration::minutes(10)),
            now,
        );
        assert!(!n.is_dispatchable(now, 3));
        assert!(n.is_dispatchable(now + Duration::minutes(10), 3));
    }

    #[test]
    fn test_read_requires_sent_or_delivered() {
        let now = Utc::now();
        let mut n = pending();
        assert!(matches!(
            n.mark_read(now),
            Err(NotificationError::InvalidTransition(_))
        ));

        n.mark_sent(now).unwrap();
        n.mark_delivered(now + Duration::seconds(1)).unwrap();
        n.mark_read(now + Duration::seconds(2)).unwrap();
        assert_eq!(n.status, NotificationStatus::Read);
        assert!(n.read_at >= n.delivered_at && n.delivered_at >= n.sent_at);

        let err = n.mark_read(now + Duration::seconds(3)).unwrap_err();
        assert!(err.to_string().contains("already read"));
    }

    #[test]
    fn test_terminal_states_reject_attempts() {
        let now = Utc::now();
        let mut n = pending();
        n.mark_sent(now).unwrap();
        assert!(n.mark_sent(now).is_err());
        assert!(n.mark_failed(now, "late", 3).is_err());
        assert!(!n.is_dispatchable(now, 3));
    }

    #[test]
    fn test_stats_count_exhausted() {
        let now = Utc::now();
        let mut stats = NotificationStats::default();

        let mut exhausted = pending();
        for _ in 0..3 {
            exhausted.mark_failed(now, "x", 3).unwrap();
        }
        let mut retryable = pending();
        retryable.mark_failed(now, "x", 3).unwrap();

        stats.record(&exhausted, 3);
        stats.record(&retryable, 3);
        stats.record(&pending(), 3);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.pending, 1);
    }
}
