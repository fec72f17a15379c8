//! Firebase Cloud Messaging push provider (legacy HTTP API).

use super::{ChannelProvider, OutboundMessage, ProviderError, Receipt};
use crate::error::NotificationError;
use crate::models::Channel;
use async_trait::async_trait;
use core_config::env_optional;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub server_key: String,
    pub api_url: String,
}

impl FcmConfig {
    pub fn new(server_key: String) -> Self {
        Self {
            server_key,
            api_url: "https://fcm.googleapis.com/fcm/send".to_string(),
        }
    }

    /// `None` when FCM_SERVER_KEY is unset
    pub fn from_env() -> Result<Option<Self>, NotificationError> {
        Ok(env_optional("FCM_SERVER_KEY").map(|key| {
            let mut config = Self::new(key);
            if let Some(url) = env_optional("FCM_API_URL") {
                config.api_url = url;
            }
            config
        }))
    }
}

pub struct FcmProvider {
    config: FcmConfig,
    client: Client,
}

impl FcmProvider {
    pub fn new(config: FcmConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

fn build_payload(message: &OutboundMessage) -> Value {
    json!({
        "to": message.recipient,
        "notification": {
            "title": message.subject,
            "body": message.body,
        },
        "data": message.metadata,
    })
}

#[derive(Debug, Deserialize)]
struct FcmResponse {
    #[serde(default)]
    failure: u32,
    #[serde(default)]
    results: Vec<FcmResult>,
}

#[derive(Debug, Deserialize)]
struct FcmResult {
    message_id: Option<String>,
    error: Option<String>,
}

/// FCM answers 200 even for per-token failures; the error string decides.
fn classify_result(response: FcmResponse) -> Result<Receipt, ProviderError> {
    let first = response.results.into_iter().next();
    match first {
        Some(FcmResult {
            error: Some(error), ..
        }) => match error.as_str() {
            "Unavailable" | "InternalServerError" | "DeviceMessageRateExceeded" => {
                Err(ProviderError::transient(format!("fcm: {error}")))
            }
            _ => Err(ProviderError::permanent(format!("fcm: {error}"))),
        },
        Some(FcmResult { message_id, .. }) if response.failure == 0 => Ok(Receipt { message_id }),
        Some(_) => Err(ProviderError::transient("fcm: delivery failure without reason")),
        None => Ok(Receipt::default()),
    }
}

#[async_trait]
impl ChannelProvider for FcmProvider {
    fn name(&self) -> &str {
        "fcm"
    }

    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, ProviderError> {
        debug!(notification_id = %message.notification_id, "Sending push via FCM");

        let response = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("key={}", self.config.server_key))
            .json(&build_payload(message))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(notification_id = %message.notification_id, status = %status, "FCM rejected push");
            return Err(ProviderError::from_status("fcm", status, &text));
        }

        let parsed: FcmResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transient(format!("invalid FCM response: {e}")))?;
        classify_result(parsed)
    }
}
