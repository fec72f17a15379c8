//! Twilio SMS provider.

use super::{ChannelProvider, OutboundMessage, ProviderError, Receipt};
use crate::error::NotificationError;
use crate::models::Channel;
use async_trait::async_trait;
use core_config::{env_optional, env_required};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub api_url: String,
}

impl TwilioConfig {
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Self {
        Self {
            account_sid,
            auth_token,
            from_number,
            api_url: "https://api.twilio.com/2010-04-01".to_string(),
        }
    }

    /// `None` when TWILIO_ACCOUNT_SID is unset
    pub fn from_env() -> Result<Option<Self>, NotificationError> {
        let Some(account_sid) = env_optional("TWILIO_ACCOUNT_SID") else {
            return Ok(None);
        };
        let mut config = Self::new(
            account_sid,
            env_required("TWILIO_AUTH_TOKEN")?,
            env_required("TWILIO_FROM_NUMBER")?,
        );
        if let Some(url) = env_optional("TWILIO_API_URL") {
            config.api_url = url;
        }
        Ok(Some(config))
    }

    fn messages_url(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", self.api_url, self.account_sid)
    }
}

pub struct TwilioProvider {
    config: TwilioConfig,
    client: Client,
}

impl TwilioProvider {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: Option<String>,
}

/// SMS has no subject line; prepend it when present.
fn sms_body(message: &OutboundMessage) -> String {
    if message.subject.trim().is_empty() {
        message.body.clone()
    } else {
        format!("{}: {}", message.subject.trim(), message.body)
    }
}

#[async_trait]
impl ChannelProvider for TwilioProvider {
    fn name(&self) -> &str {
        "twilio"
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, ProviderError> {
        debug!(notification_id = %message.notification_id, "Sending SMS via Twilio");

        let body = sms_body(message);
        let form = [
            ("To", message.recipient.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Body", body.as_str()),
        ];

        let response = self
            .client
            .post(self.config.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let resource: MessageResource = response
                .json()
                .await
                .map_err(|e| ProviderError::transient(format!("invalid Twilio response: {e}")))?;
            Ok(Receipt {
                message_id: resource.sid,
            })
        } else {
            let text = response.text().await.unwrap_or_default();
            warn!(notification_id = %message.notification_id, status = %status, "Twilio rejected SMS");
            Err(ProviderError::from_status("twilio", status, &text))
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.config.account_sid.starts_with("AC") {
            Ok(())
        } else {
            Err(ProviderError::permanent("invalid Twilio account SID"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn test_messages_url() {
        let config = TwilioConfig::new("AC123".into(), "token".into(), "+15550000000".into());
        assert_eq!(
            config.messages_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[test]
    fn test_sms_body_prefixes_subject() {
        let mut message = OutboundMessage {
            notification_id: Uuid::nil(),
            tenant_id: "t".into(),
            recipient: "+15551234567".into(),
            subject: "Alert".into(),
            body: "disk full".into(),
            metadata: BTreeMap::new(),
        };
        assert_eq!(sms_body(&message), "Alert: disk full");

        message.subject.clear();
        assert_eq!(sms_body(&message), "disk full");
    }

    #[test]
    fn test_config_requires_token_when_sid_set() {
        temp_env::with_vars(
            [
                ("TWILIO_ACCOUNT_SID", Some("AC1")),
                ("TWILIO_AUTH_TOKEN", None),
                ("TWILIO_FROM_NUMBER", Some("+15550000000")),
            ],
            || {
                let err = TwilioConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("TWILIO_AUTH_TOKEN"));
            },
        );
    }
}
