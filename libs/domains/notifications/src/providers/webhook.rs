//! Generic HTTP webhook provider. The recipient is the target URL.

use super::{ChannelProvider, OutboundMessage, ProviderError, Receipt};
use crate::error::NotificationError;
use crate::models::Channel;
use async_trait::async_trait;
use chrono::Utc;
use core_config::{env_optional, env_or_default};
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    /// Extra static headers
    pub headers: Vec<(String, String)>,
    pub user_agent: String,
}

impl WebhookConfig {
    pub fn from_env() -> Result<Self, NotificationError> {
        Ok(Self {
            auth_token: env_optional("WEBHOOK_AUTH_TOKEN"),
            headers: Vec::new(),
            user_agent: env_or_default("WEBHOOK_USER_AGENT", "notifications-webhook/1.0"),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

pub struct WebhookProvider {
    config: WebhookConfig,
    client: Client,
}

impl WebhookProvider {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn build_headers(&self, message: &OutboundMessage) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                value.parse::<HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }
        if let Ok(value) = message.notification_id.to_string().parse() {
            headers.insert("x-notification-id", value);
        }
        if let Ok(value) = message.tenant_id.parse() {
            headers.insert("x-tenant-id", value);
        }
        if !self.config.user_agent.is_empty() {
            if let Ok(value) = self.config.user_agent.parse() {
                headers.insert(reqwest::header::USER_AGENT, value);
            }
        }
        headers
    }
}

fn build_payload(message: &OutboundMessage) -> Value {
    json!({
        "id": message.notification_id,
        "tenant_id": message.tenant_id,
        "subject": message.subject,
        "message": message.body,
        "metadata": message.metadata,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[async_trait]
impl ChannelProvider for WebhookProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, ProviderError> {
        debug!(notification_id = %message.notification_id, url = %message.recipient, "Posting webhook");

        let mut request = self
            .client
            .post(&message.recipient)
            .headers(self.build_headers(message))
            .json(&build_payload(message));
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(Receipt::default())
        } else {
            let text = response.text().await.unwrap_or_default();
            warn!(notification_id = %message.notification_id, status = %status, "Webhook endpoint rejected request");
            Err(ProviderError::from_status("webhook", status, &text))
        }
    }
}
