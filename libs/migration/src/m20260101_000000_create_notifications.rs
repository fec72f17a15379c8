use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Channel, priority and status are stored as text so new values need
        // no type migration; priority_rank carries the sort order.
        manager
            .create_table(
                Table::create()
                    .table(Notifications::Table)
                    .if_not_exists()
                    .col(pk_uuid(Notifications::Id))
                    .col(string_len(Notifications::TenantId, 128))
                    .col(string_null(Notifications::UserId))
                    .col(string_len(Notifications::Channel, 16))
                    .col(string_len(Notifications::Priority, 16).default("normal"))
                    .col(small_integer(Notifications::PriorityRank).default(1))
                    .col(text(Notifications::Subject).default(""))
                    .col(text(Notifications::Message))
                    .col(string(Notifications::Recipient))
                    .col(json_binary(Notifications::Metadata).default("{}"))
                    .col(string_len(Notifications::Status, 16).default("pending"))
                    .col(integer(Notifications::RetryCount).default(0))
                    .col(text_null(Notifications::Error))
                    .col(
                        timestamp_with_time_zone(Notifications::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Notifications::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(Notifications::ScheduledFor))
                    .col(timestamp_with_time_zone_null(Notifications::SentAt))
                    .col(timestamp_with_time_zone_null(Notifications::DeliveredAt))
                    .col(timestamp_with_time_zone_null(Notifications::ReadAt))
                    .col(timestamp_with_time_zone_null(Notifications::FailedAt))
                    .to_owned(),
            )
            .await?;

        // Pending sweep: status = 'pending' ORDER BY priority_rank DESC, created_at
        manager
            .create_index(
                Index::create()
                    .name("idx_notifications_pending_sweep")
                    .table(Notifications::Table)
                    .col(Notifications::Status)
                    .col((Notifications::PriorityRank, IndexOrder::Desc))
                    .col(Notifications::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // Retry sweep: status = 'failed' ORDER BY priority_rank DESC, failed_at
        manager
            .create_index(
                Index::create()
                    .name("idx_notifications_retry_sweep")
                    .table(Notifications::Table)
                    .col(Notifications::Status)
                    .col((Notifications::PriorityRank, IndexOrder::Desc))
                    .col(Notifications::FailedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_notifications_tenant_status")
                    .table(Notifications::Table)
                    .col(Notifications::TenantId)
                    .col(Notifications::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Notifications::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Notifications {
    Table,
    Id,
    TenantId,
    UserId,
    Channel,
    Priority,
    PriorityRank,
    Subject,
    Message,
    Recipient,
    Metadata,
    Status,
    RetryCount,
    Error,
    CreatedAt,
    UpdatedAt,
    ScheduledFor,
    SentAt,
    DeliveredAt,
    ReadAt,
    FailedAt,
}
