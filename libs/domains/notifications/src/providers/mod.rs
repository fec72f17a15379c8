//! Channel providers.
//!
//! One [`ChannelProvider`] per channel, all behind the same `send` contract,
//! looked up by channel through a [`ProviderSet`]. The engine only ever sees
//! the transient/permanent hint on a [`ProviderError`].

mod email;
mod in_app;
pub mod mock;
mod push;
mod sms;
mod webhook;

pub use email::{SendGridConfig, SendGridProvider};
pub use in_app::{InAppHub, InAppMessage, InAppProvider};
pub use mock::MockProvider;
pub use push::{FcmConfig, FcmProvider};
pub use sms::{TwilioConfig, TwilioProvider};
pub use webhook::{WebhookConfig, WebhookProvider};

use crate::error::NotificationError;
use crate::models::{Channel, Notification};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Everything a provider needs to deliver one notification.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub notification_id: Uuid,
    pub tenant_id: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

impl From<&Notification> for OutboundMessage {
    fn from(n: &Notification) -> Self {
        Self {
            notification_id: n.id,
            tenant_id: n.tenant_id.clone(),
            recipient: n.recipient.clone(),
            subject: n.subject.clone(),
            body: n.message.clone(),
            metadata: n.metadata.clone(),
        }
    }
}

/// Provider acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    /// Provider-specific message id, when the API returns one
    pub message_id: Option<String>,
}

/// Failed send, with the only hint the engine acts on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Might succeed later: 5xx, 408, 429, network and timeout errors
    #[error("{0}")]
    Transient(String),
    /// The request itself was rejected (other 4xx)
    #[error("{0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(provider: &str, status: StatusCode, body: &str) -> Self {
        let message = format!("{} returned {}: {}", provider, status, body.trim());
        if is_permanent_status(status) {
            Self::Permanent(message)
        } else {
            Self::Transient(message)
        }
    }

    pub fn into_notification_error(self, provider: &str) -> NotificationError {
        let permanent = self.is_permanent();
        let message = match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        };
        NotificationError::provider(provider, message, permanent)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if is_permanent_status(status) => Self::Permanent(err.to_string()),
            _ => Self::Transient(err.to_string()),
        }
    }
}

/// 4xx other than 408 and 429 will fail the same way on every retry.
pub fn is_permanent_status(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

/// Uniform send contract, implemented once per channel.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Stable provider name; also the circuit breaker key.
    fn name(&self) -> &str;

    fn channel(&self) -> Channel;

    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, ProviderError>;

    /// Check if the provider is configured and reachable.
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Channel to provider lookup table.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<Channel, Arc<dyn ChannelProvider>>,
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<(&Channel, &str)> =
            self.providers.iter().map(|(c, p)| (c, p.name())).collect();
        names.sort();
        f.debug_struct("ProviderSet").field("providers", &names).finish()
    }
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for its channel, replacing any previous one.
    pub fn with(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn ChannelProvider>) {
        self.providers.insert(provider.channel(), provider);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.providers.keys().copied().collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Providers whose credentials are present in the environment, plus the
    /// webhook and in-app providers which need none.
    pub fn from_env(hub: InAppHub) -> Result<Self, NotificationError> {
        let mut set = Self::new();

        match SendGridConfig::from_env()? {
            Some(config) => set.register(Arc::new(SendGridProvider::new(config))),
            None => tracing::warn!("SENDGRID_API_KEY not set, email channel has no provider"),
        }
        match TwilioConfig::from_env()? {
            Some(config) => set.register(Arc::new(TwilioProvider::new(config))),
            None => tracing::warn!("TWILIO_ACCOUNT_SID not set, sms channel has no provider"),
        }
        match FcmConfig::from_env()? {
            Some(config) => set.register(Arc::new(FcmProvider::new(config))),
            None => tracing::warn!("FCM_SERVER_KEY not set, push channel has no provider"),
        }
        set.register(Arc::new(WebhookProvider::new(WebhookConfig::from_env()?)));
        set.register(Arc::new(InAppProvider::new(hub)));

        tracing::info!(channels = ?set.channels(), "Channel providers configured");
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(is_permanent_status(StatusCode::BAD_REQUEST));
        assert!(is_permanent_status(StatusCode::UNAUTHORIZED));
        assert!(is_permanent_status(StatusCode::NOT_FOUND));
        assert!(!is_permanent_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_permanent_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_permanent_status(StatusCode::BAD_GATEWAY));
        assert!(!is_permanent_status(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn test_from_status_message() {
        let err = ProviderError::from_status("twilio", StatusCode::BAD_REQUEST, " bad number ");
        assert!(err.is_permanent());
        assert_eq!(err.to_string(), "twilio returned 400 Bad Request: bad number");

        let converted = err.into_notification_error("twilio");
        assert!(!converted.counts_as_breaker_failure());
    }

    #[test]
    fn test_provider_set_lookup_by_channel() {
        let set = ProviderSet::new()
            .with(Arc::new(MockProvider::new("sendgrid", Channel::Email)))
            .with(Arc::new(MockProvider::new("twilio", Channel::Sms)));

        assert_eq!(set.len(), 2);
        assert_eq!(set.get(Channel::Email).unwrap().name(), "sendgrid");
        assert!(set.get(Channel::Push).is_none());
        assert_eq!(set.channels(), vec![Channel::Email, Channel::Sms]);
    }

    #[test]
    fn test_provider_set_from_env_without_credentials() {
        temp_env::with_vars_unset(
            ["SENDGRID_API_KEY", "TWILIO_ACCOUNT_SID", "FCM_SERVER_KEY"],
            || {
                let set = ProviderSet::from_env(InAppHub::new(16)).unwrap();
                assert_eq!(set.channels(), vec![Channel::InApp, Channel::Webhook]);
            },
        );
    }
}
