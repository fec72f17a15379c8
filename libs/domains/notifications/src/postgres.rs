use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use uuid::Uuid;

use crate::{
    config::RetryPolicy,
    entity,
    error::{NotificationError, NotificationResult},
    models::{Notification, NotificationStats, NotificationStatus},
    repository::{NotificationRepository, Revision},
};

fn db_error(e: sea_orm::DbErr) -> NotificationError {
    NotificationError::Persistence(format!("Database error: {}", e))
}

fn into_domain(models: Vec<entity::Model>) -> NotificationResult<Vec<Notification>> {
    models.into_iter().map(Notification::try_from).collect()
}

fn count_column(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Backoff gate for the retry sweep, one branch per `retry_count` until the
/// backoff stops growing; the last branch covers every higher count.
fn retry_ready(policy: &RetryPolicy, now: DateTime<Utc>) -> Condition {
    let mut ready = Condition::any();
    let mut count = 0;
    while count < policy.max_retries {
        let saturated = count > 0 && policy.backoff(count) == policy.backoff(count.saturating_add(1));
        let bucket = if saturated {
            entity::Column::RetryCount.gte(count_column(count))
        } else {
            entity::Column::RetryCount.eq(count_column(count))
        };

        if policy.backoff(count).is_zero() {
            ready = ready.add(bucket);
        } else if let Some(cutoff) = policy.ready_cutoff(count, now) {
            ready = ready.add(
                Condition::all().add(bucket).add(
                    Condition::any()
                        .add(entity::Column::FailedAt.is_null())
                        .add(entity::Column::FailedAt.lte(cutoff)),
                ),
            );
        }

        if saturated {
            break;
        }
        count += 1;
    }
    ready
}

pub struct PgNotificationRepository {
    db: DatabaseConnection,
}

impl PgNotificationRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn tenant_filter(tenant_id: Option<&str>) -> Condition {
        match tenant_id {
            Some(tenant) => Condition::all().add(entity::Column::TenantId.eq(tenant)),
            None => Condition::all(),
        }
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn create(&self, notification: &Notification) -> NotificationResult<()> {
        let active_model: entity::ActiveModel = notification.into();

        entity::Entity::insert(active_model)
            .exec_without_returning(&self.db)
            .await
            .map_err(db_error)?;

        tracing::debug!(notification_id = %notification.id, "Inserted notification");
        Ok(())
    }

    async fn update(&self, notification: &Notification, expected: Revision) -> NotificationResult<()> {
        let active_model: entity::ActiveModel = notification.into();

        let result = entity::Entity::update_many()
            .set(active_model)
            .filter(entity::Column::Id.eq(notification.id))
            .filter(entity::Column::Status.eq(expected.status.to_string()))
            .filter(entity::Column::RetryCount.eq(count_column(expected.retry_count)))
            .exec(&self.db)
            .await
            .map_err(db_error)?;

        if result.rows_affected == 0 {
            let exists = entity::Entity::find_by_id(notification.id)
                .count(&self.db)
                .await
                .map_err(db_error)?
                > 0;
            return Err(if exists {
                NotificationError::Conflict(notification.id)
            } else {
                NotificationError::NotFound(notification.id)
            });
        }
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> NotificationResult<Option<Notification>> {
        let model = entity::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(db_error)?;

        model.map(Notification::try_from).transpose()
    }

    async fn get_pending(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> NotificationResult<Vec<Notification>> {
        let models = entity::Entity::find()
            .filter(entity::Column::Status.eq(NotificationStatus::Pending.to_string()))
            .filter(
                Condition::any()
                    .add(entity::Column::ScheduledFor.is_null())
                    .add(entity::Column::ScheduledFor.lte(now)),
            )
            .order_by_desc(entity::Column::PriorityRank)
            .order_by_asc(entity::Column::CreatedAt)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(db_error)?;

        into_domain(models)
    }

    async fn get_failed_retryable(
        &self,
        policy: RetryPolicy,
        now: DateTime<Utc>,
        limit: u64,
    ) -> NotificationResult<Vec<Notification>> {
        let models = entity::Entity::find()
            .filter(entity::Column::Status.eq(NotificationStatus::Failed.to_string()))
            .filter(entity::Column::RetryCount.lt(count_column(policy.max_retries)))
            .filter(retry_ready(&policy, now))
            .order_by_desc(entity::Column::PriorityRank)
            .order_by_asc(entity::Column::FailedAt)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(db_error)?;

        into_domain(models)
    }

    async fn stats(
        &self,
        tenant_id: Option<String>,
        max_retries: u32,
    ) -> NotificationResult<NotificationStats> {
        let rows: Vec<(String, i64)> = entity::Entity::find()
            .select_only()
            .column(entity::Column::Status)
            .column_as(entity::Column::Id.count(), "count")
            .filter(Self::tenant_filter(tenant_id.as_deref()))
            .group_by(entity::Column::Status)
            .into_tuple()
            .all(&self.db)
            .await
            .map_err(db_error)?;

        let mut stats = NotificationStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            stats.total += count;
            match status.parse::<NotificationStatus>() {
                Ok(NotificationStatus::Pending) => stats.pending += count,
                Ok(NotificationStatus::Sent) => stats.sent += count,
                Ok(NotificationStatus::Delivered) => stats.delivered += count,
                Ok(NotificationStatus::Read) => stats.read += count,
                Ok(NotificationStatus::Failed) => stats.failed += count,
                Err(_) => tracing::warn!(status = %status, "Unknown notification status in store"),
            }
        }

        stats.exhausted = entity::Entity::find()
            .filter(Self::tenant_filter(tenant_id.as_deref()))
            .filter(entity::Column::Status.eq(NotificationStatus::Failed.to_string()))
            .filter(entity::Column::RetryCount.gte(count_column(max_retries)))
            .count(&self.db)
            .await
            .map_err(db_error)?;

        Ok(stats)
    }
}
