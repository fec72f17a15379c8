//! SendGrid email provider.

use super::{ChannelProvider, OutboundMessage, ProviderError, Receipt};
use crate::error::NotificationError;
use crate::models::Channel;
use async_trait::async_trait;
use core_config::{env_optional, env_or_default, env_required};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// SendGrid API configuration.
#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    pub from_email: String,
    pub from_name: String,
    /// SendGrid API base URL (defaults to production).
    pub api_url: String,
}

impl SendGridConfig {
    pub fn new(api_key: String, from_email: String, from_name: String) -> Self {
        Self {
            api_key,
            from_email,
            from_name,
            api_url: "https://api.sendgrid.com/v3".to_string(),
        }
    }

    /// `None` when SENDGRID_API_KEY is unset. With a key present the sender
    /// address becomes required.
    pub fn from_env() -> Result<Option<Self>, NotificationError> {
        let Some(api_key) = env_optional("SENDGRID_API_KEY") else {
            return Ok(None);
        };
        let from_email = env_required("SENDGRID_FROM_EMAIL")?;
        let from_name = env_or_default("SENDGRID_FROM_NAME", "Notifications");

        let mut config = Self::new(api_key, from_email, from_name);
        if let Some(url) = env_optional("SENDGRID_API_URL") {
            config.api_url = url;
        }
        Ok(Some(config))
    }
}

/// SendGrid email provider.
pub struct SendGridProvider {
    config: SendGridConfig,
    client: Client,
}

impl SendGridProvider {
    pub fn new(config: SendGridConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

// SendGrid API request/response structures

#[derive(Debug, Serialize)]
struct SendGridRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: EmailAddress<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_args: Option<&'a std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<EmailAddress<'a>>,
}

#[derive(Debug, Serialize)]
struct EmailAddress<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendGridError {
    errors: Vec<SendGridErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SendGridErrorDetail {
    message: String,
}

fn build_request<'a>(config: &'a SendGridConfig, message: &'a OutboundMessage) -> SendGridRequest<'a> {
    SendGridRequest {
        personalizations: vec![Personalization {
            to: vec![EmailAddress {
                email: &message.recipient,
                name: None,
            }],
        }],
        from: EmailAddress {
            email: &config.from_email,
            name: Some(&config.from_name),
        },
        subject: &message.subject,
        content: vec![Content {
            content_type: "text/plain",
            value: &message.body,
        }],
        custom_args: (!message.metadata.is_empty()).then_some(&message.metadata),
    }
}

/// Flatten SendGrid's `{"errors": [{"message": ..}]}` body, or pass it through.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<SendGridError>(body) {
        Ok(parsed) => parsed
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join(", "),
        Err(_) => body.to_string(),
    }
}

#[async_trait]
impl ChannelProvider for SendGridProvider {
    fn name(&self) -> &str {
        "sendgrid"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, ProviderError> {
        let request = build_request(&self.config, message);

        debug!(
            notification_id = %message.notification_id,
            subject = %message.subject,
            "Sending email via SendGrid"
        );

        let response = self
            .client
            .post(format!("{}/mail/send", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            info!(
                notification_id = %message.notification_id,
                message_id = ?message_id,
                "Email accepted by SendGrid"
            );
            Ok(Receipt { message_id })
        } else {
            let body = response.text().await.unwrap_or_default();
            error!(
                notification_id = %message.notification_id,
                status = %status,
                "SendGrid rejected email"
            );
            Err(ProviderError::from_status("sendgrid", status, &error_message(&body)))
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        // No dedicated health endpoint; check the key format instead
        if self.config.api_key.starts_with("SG.") {
            Ok(())
        } else {
            Err(ProviderError::permanent("invalid SendGrid API key format"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn message() -> OutboundMessage {
        OutboundMessage {
            notification_id: Uuid::nil(),
            tenant_id: "tenant-a".into(),
            recipient: "user@example.com".into(),
            subject: "Welcome".into(),
            body: "Hello".into(),
            metadata: BTreeMap::from([("campaign".to_string(), "spring".to_string())]),
        }
    }

    #[test]
    fn test_request_payload_shape() {
        let config = SendGridConfig::new(
            "SG.key".into(),
            "noreply@example.com".into(),
            "Example".into(),
        );
        let msg = message();
        let json = serde_json::to_value(build_request(&config, &msg)).unwrap();

        assert_eq!(json["personalizations"][0]["to"][0]["email"], "user@example.com");
        assert_eq!(json["from"]["name"], "Example");
        assert_eq!(json["content"][0]["type"], "text/plain");
        assert_eq!(json["custom_args"]["campaign"], "spring");
    }

    #[test]
    fn test_error_message_parsing() {
        let body = r#"{"errors":[{"message":"bad from"},{"message":"bad to","field":"to"}]}"#;
        assert_eq!(error_message(body), "bad from, bad to");
        assert_eq!(error_message("plain failure"), "plain failure");
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("SENDGRID_API_KEY", Some("SG.abc")),
                ("SENDGRID_FROM_EMAIL", Some("noreply@example.com")),
                ("SENDGRID_FROM_NAME", None),
                ("SENDGRID_API_URL", None),
            ],
            || {
                let config = SendGridConfig::from_env().unwrap().unwrap();
                assert_eq!(config.from_name, "Notifications");
                assert_eq!(config.api_url, "https://api.sendgrid.com/v3");
            },
        );

        temp_env::with_vars(
            [("SENDGRID_API_KEY", Some("SG.abc")), ("SENDGRID_FROM_EMAIL", None)],
            || {
                assert!(SendGridConfig::from_env().is_err());
            },
        );
    }

    #[tokio::test]
    async fn test_health_check_validates_key_prefix() {
        let ok = SendGridProvider::new(SendGridConfig::new("SG.x".into(), "a@b.co".into(), "n".into()));
        assert!(ok.health_check().await.is_ok());

        let bad = SendGridProvider::new(SendGridConfig::new("nope".into(), "a@b.co".into(), "n".into()));
        assert!(bad.health_check().await.unwrap_err().is_permanent());
    }
}
