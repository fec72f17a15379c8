//! Lifecycle event publishing.
//!
//! Publishing is fire-and-forget from the engine's point of view: a failed
//! publish is logged and never rolls back the state change that caused it.

use crate::error::{NotificationError, NotificationResult};
use crate::models::Notification;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub const NOTIFICATION_CREATED: &str = "notification.created";
pub const NOTIFICATION_SENT: &str = "notification.sent";
pub const NOTIFICATION_FAILED: &str = "notification.failed";
pub const NOTIFICATION_DELIVERED: &str = "notification.delivered";
pub const NOTIFICATION_READ: &str = "notification.read";

/// Lifecycle payload: the record's identity and current delivery state.
pub fn event_payload(notification: &Notification) -> Value {
    json!({
        "id": notification.id,
        "tenant_id": notification.tenant_id,
        "user_id": notification.user_id,
        "channel": notification.channel,
        "priority": notification.priority,
        "status": notification.status,
        "retry_count": notification.retry_count,
        "error": notification.error,
        "created_at": notification.created_at,
        "updated_at": notification.updated_at,
    })
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &Value) -> NotificationResult<()>;
}

/// Writes events to the log only.
#[derive(Debug, Clone, Default)]
pub struct LoggingPublisher;

#[async_trait]
impl EventPublisher for LoggingPublisher {
    async fn publish(&self, topic: &str, payload: &Value) -> NotificationResult<()> {
        info!(topic, payload = %payload, "Lifecycle event");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub topic: String,
    pub payload: Value,
}

/// In-process fan-out of lifecycle events.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, topic: &str, payload: &Value) -> NotificationResult<()> {
        let event = LifecycleEvent {
            topic: topic.to_string(),
            payload: payload.clone(),
        };
        // No subscribers is not an error.
        let receivers = self.sender.send(event).unwrap_or(0);
        debug!(topic, receivers, "Broadcast lifecycle event");
        Ok(())
    }
}

/// Appends events to a capped Redis stream.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    redis: ConnectionManager,
    stream_name: String,
    max_length: usize,
}

impl RedisStreamPublisher {
    pub fn new(redis: ConnectionManager, stream_name: impl Into<String>, max_length: usize) -> Self {
        Self {
            redis,
            stream_name: stream_name.into(),
            max_length,
        }
    }

    pub async fn connect(config: &core_config::redis::RedisConfig) -> NotificationResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager, &config.stream_name, config.max_stream_length))
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish(&self, topic: &str, payload: &Value) -> NotificationResult<()> {
        let mut conn = self.redis.clone();
        let event = serde_json::to_string(&LifecycleEvent {
            topic: topic.to_string(),
            payload: payload.clone(),
        })?;

        let id: String = redis::cmd("XADD")
            .arg(&self.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg("event")
            .arg(&event)
            .query_async(&mut conn)
            .await
            .map_err(|e| NotificationError::Publish(format!("XADD {}: {}", self.stream_name, e)))?;

        debug!(topic, stream_id = %id, stream = %self.stream_name, "Published lifecycle event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, CreateNotification};
    use chrono::Utc;

    #[tokio::test]
    async fn test_broadcast_publisher_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher
            .publish(NOTIFICATION_SENT, &json!({ "id": "1" }))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, "notification.sent");
        assert_eq!(event.payload["id"], "1");
    }

    #[tokio::test]
    async fn test_broadcast_publisher_without_subscribers_is_ok() {
        let publisher = BroadcastPublisher::new(1);
        assert!(publisher.publish(NOTIFICATION_READ, &json!({})).await.is_ok());
    }

    #[test]
    fn test_event_payload_fields() {
        let n = Notification::new(
            CreateNotification::new("tenant-a", Channel::Webhook, "https://hooks.example.com", "ping"),
            Utc::now(),
        );
        let payload = event_payload(&n);

        assert_eq!(payload["tenant_id"], "tenant-a");
        assert_eq!(payload["channel"], "webhook");
        assert_eq!(payload["status"], "pending");
        assert_eq!(payload["retry_count"], 0);
        assert!(payload.get("message").is_none());
    }
}
