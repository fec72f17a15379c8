use crate::error::NotificationError;
use crate::models::Notification;
use sea_orm::ActiveValue::Set;
use sea_orm::entity::prelude::*;
use std::collections::BTreeMap;

/// Sea-ORM Entity for the notifications table
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "notifications")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub channel: String,
    pub priority: String,
    /// Numeric priority so sweeps can sort in SQL
    pub priority_rank: i16,
    #[sea_orm(column_type = "Text")]
    pub subject: String,
    #[sea_orm(column_type = "Text")]
    pub message: String,
    pub recipient: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Json,
    pub status: String,
    pub retry_count: i32,
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
    pub scheduled_for: Option<DateTimeWithTimeZone>,
    pub sent_at: Option<DateTimeWithTimeZone>,
    pub delivered_at: Option<DateTimeWithTimeZone>,
    pub read_at: Option<DateTimeWithTimeZone>,
    pub failed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

fn parse_column<T: std::str::FromStr>(column: &str, value: &str) -> Result<T, NotificationError> {
    value.parse().map_err(|_| {
        NotificationError::Persistence(format!("invalid {} value '{}' in notifications", column, value))
    })
}

// Conversion from Sea-ORM Model to domain Notification
impl TryFrom<Model> for Notification {
    type Error = NotificationError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let metadata: BTreeMap<String, String> = serde_json::from_value(model.metadata)?;

        Ok(Self {
            id: model.id,
            channel: parse_column("channel", &model.channel)?,
            priority: parse_column("priority", &model.priority)?,
            status: parse_column("status", &model.status)?,
            tenant_id: model.tenant_id,
            user_id: model.user_id,
            subject: model.subject,
            message: model.message,
            recipient: model.recipient,
            metadata,
            retry_count: u32::try_from(model.retry_count).unwrap_or(0),
            error: model.error,
            created_at: model.created_at.into(),
            updated_at: model.updated_at.into(),
            scheduled_for: model.scheduled_for.map(Into::into),
            sent_at: model.sent_at.map(Into::into),
            delivered_at: model.delivered_at.map(Into::into),
            read_at: model.read_at.map(Into::into),
            failed_at: model.failed_at.map(Into::into),
        })
    }
}

// Conversion from domain Notification to a fully-set ActiveModel
impl From<&Notification> for ActiveModel {
    fn from(n: &Notification) -> Self {
        ActiveModel {
            id: Set(n.id),
            tenant_id: Set(n.tenant_id.clone()),
            user_id: Set(n.user_id.clone()),
            channel: Set(n.channel.to_string()),
            priority: Set(n.priority.to_string()),
            priority_rank: Set(n.priority.rank()),
            subject: Set(n.subject.clone()),
            message: Set(n.message.clone()),
            recipient: Set(n.recipient.clone()),
            metadata: Set(serde_json::json!(n.metadata)),
            status: Set(n.status.to_string()),
            retry_count: Set(i32::try_from(n.retry_count).unwrap_or(i32::MAX)),
            error: Set(n.error.clone()),
            created_at: Set(n.created_at.into()),
            updated_at: Set(n.updated_at.into()),
            scheduled_for: Set(n.scheduled_for.map(Into::into)),
            sent_at: Set(n.sent_at.map(Into::into)),
            delivered_at: Set(n.delivered_at.map(Into::into)),
            read_at: Set(n.read_at.map(Into::into)),
            failed_at: Set(n.failed_at.map(Into::into)),
        }
    }
}
