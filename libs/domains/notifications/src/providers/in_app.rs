//! In-app delivery through an in-process broadcast hub.
//!
//! Connected clients (websocket/SSE handlers) subscribe to the hub; the
//! notification record itself is the durable inbox.

use super::{ChannelProvider, OutboundMessage, ProviderError, Receipt};
use crate::models::Channel;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InAppMessage {
    pub notification_id: Uuid,
    pub tenant_id: String,
    /// Inbox owner
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct InAppHub {
    sender: broadcast::Sender<InAppMessage>,
}

impl InAppHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InAppMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct InAppProvider {
    hub: InAppHub,
}

impl InAppProvider {
    pub fn new(hub: InAppHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl ChannelProvider for InAppProvider {
    fn name(&self) -> &str {
        "in_app"
    }

    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, ProviderError> {
        let live = InAppMessage {
            notification_id: message.notification_id,
            tenant_id: message.tenant_id.clone(),
            recipient: message.recipient.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            metadata: message.metadata.clone(),
        };

        // No connected clients is fine; the inbox is read from the store.
        let receivers = self.hub.sender.send(live).unwrap_or(0);
        tracing::debug!(notification_id = %message.notification_id, receivers, "In-app message published");

        Ok(Receipt {
            message_id: Some(message.notification_id.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage {
            notification_id: Uuid::now_v7(),
            tenant_id: "tenant-a".into(),
            recipient: "user-1".into(),
            subject: "Hi".into(),
            body: "Welcome".into(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_in_app_reaches_subscribers() {
        let hub = InAppHub::new(8);
        let mut rx = hub.subscribe();
        let provider = InAppProvider::new(hub.clone());

        let msg = message();
        let receipt = provider.send(&msg).await.unwrap();
        assert_eq!(receipt.message_id, Some(msg.notification_id.to_string()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.recipient, "user-1");
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_in_app_without_subscribers_succeeds() {
        let provider = InAppProvider::new(InAppHub::new(8));
        assert!(provider.send(&message()).await.is_ok());
    }
}
