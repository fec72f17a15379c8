use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{NotificationError, NotificationResult};
use crate::models::{Notification, NotificationStats, NotificationStatus};

/// The persisted state an update was computed from. An update only applies
/// while the stored record still matches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    pub status: NotificationStatus,
    pub retry_count: u32,
}

impl Revision {
    pub fn of(notification: &Notification) -> Self {
        Self {
            status: notification.status,
            retry_count: notification.retry_count,
        }
    }

    pub fn matches(&self, notification: &Notification) -> bool {
        *self == Self::of(notification)
    }
}

/// Persistence for notification records.
///
/// Records are only written by the delivery engine and never deleted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert a new record
    async fn create(&self, notification: &Notification) -> NotificationResult<()>;

    /// Replace an existing record if it is still at `expected`. `NotFound` if
    /// it does not exist, `Conflict` if another writer changed it first.
    async fn update(&self, notification: &Notification, expected: Revision) -> NotificationResult<()>;

    async fn get_by_id(&self, id: Uuid) -> NotificationResult<Option<Notification>>;

    /// `pending` records whose schedule gate has passed at `now`, highest
    /// priority first, then oldest first.
    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> NotificationResult<Vec<Notification>>;

    /// `failed` records with retries left whose backoff has elapsed at
    /// `now`, highest priority first, then earliest failure first.
    async fn get_failed_retryable(
        &self,
        policy: RetryPolicy,
        now: DateTime<Utc>,
        limit: u64,
    ) -> NotificationResult<Vec<Notification>>;

    /// Counts per status, optionally for one tenant
    async fn stats(
        &self,
        tenant_id: Option<String>,
        max_retries: u32,
    ) -> NotificationResult<NotificationStats>;
}

/// In-process store for tests and single-node runs without a database.
#[derive(Clone, Default)]
pub struct InMemoryNotificationRepository {
    notifications: Arc<RwLock<HashMap<Uuid, Notification>>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.notifications.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.notifications.read().await.is_empty()
    }

    /// Every record, oldest first
    pub async fn all(&self) -> Vec<Notification> {
        let mut all: Vec<Notification> = self.notifications.read().await.values().cloned().collect();
        all.sort_by_key(|n| (n.created_at, n.id));
        all
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create(&self, notification: &Notification) -> NotificationResult<()> {
        let mut notifications = self.notifications.write().await;
        if notifications.contains_key(&notification.id) {
            return Err(NotificationError::Persistence(format!(
                "notification {} already exists",
                notification.id
            )));
        }
        notifications.insert(notification.id, notification.clone());
        Ok(())
    }

    async fn update(&self, notification: &Notification, expected: Revision) -> NotificationResult<()> {
        let mut notifications = self.notifications.write().await;
        match notifications.get_mut(&notification.id) {
            Some(existing) if expected.matches(existing) => {
                *existing = notification.clone();
                Ok(())
            }
            Some(_) => Err(NotificationError::Conflict(notification.id)),
            None => Err(NotificationError::NotFound(notification.id)),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> NotificationResult<Option<Notification>> {
        Ok(self.notifications.read().await.get(&id).cloned())
    }

    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> NotificationResult<Vec<Notification>> {
        let notifications = self.notifications.read().await;
        let mut pending: Vec<Notification> = notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Pending && n.is_due(now))
            .cloned()
            .collect();

        pending.sort_by_key(|n| (Reverse(n.priority.rank()), n.created_at, n.id));
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn get_failed_retryable(
        &self,
        policy: RetryPolicy,
        now: DateTime<Utc>,
        limit: u64,
    ) -> NotificationResult<Vec<Notification>> {
        let notifications = self.notifications.read().await;
        let mut failed: Vec<Notification> = notifications
            .values()
            .filter(|n| policy.is_retry_ready(n, now))
            .cloned()
            .collect();

        failed.sort_by_key(|n| (Reverse(n.priority.rank()), n.failed_at, n.id));
        failed.truncate(limit as usize);
        Ok(failed)
    }

    async fn stats(
        &self,
        tenant_id: Option<String>,
        max_retries: u32,
    ) -> NotificationResult<NotificationStats> {
        let notifications = self.notifications.read().await;
        let mut stats = NotificationStats::default();
        notifications
            .values()
            .filter(|n| tenant_id.as_deref().is_none_or(|t| n.tenant_id == t))
            .for_each(|n| stats.record(n, max_retries));
        Ok(stats)
    }
}
