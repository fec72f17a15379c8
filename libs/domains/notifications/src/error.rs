//! Error types for the notifications domain.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
///
/// Only [`NotificationError::Validation`] is ever returned to a submitter.
/// Everything that goes wrong during an asynchronous delivery attempt is
/// recorded on the notification record instead.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Malformed request. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The limiter for this channel/tenant had no tokens.
    #[error("Rate limit exceeded for '{0}'")]
    RateLimitExceeded(String),

    /// The provider's breaker is open; the provider was not called.
    #[error("Circuit open for provider '{0}'")]
    CircuitOpen(String),

    /// The provider's breaker is half-open and already probing.
    #[error("Provider '{0}' is probing recovery, request rejected")]
    TooManyRequests(String),

    /// The provider call failed. `permanent` marks client-side failures.
    #[error("Provider '{provider}' error: {message}")]
    Provider {
        provider: String,
        message: String,
        permanent: bool,
    },

    /// A provider or store call exceeded its deadline.
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Notification not found: {0}")]
    NotFound(Uuid),

    /// Another writer updated the record since it was read.
    #[error("Notification {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Event publish error: {0}")]
    Publish(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotificationError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>, permanent: bool) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            permanent,
        }
    }

    /// Whether a later attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimitExceeded(_)
            | Self::CircuitOpen(_)
            | Self::TooManyRequests(_)
            | Self::Timeout { .. }
            | Self::Persistence(_)
            | Self::Publish(_) => true,
            Self::Provider { permanent, .. } => !permanent,
            _ => false,
        }
    }

    /// Whether this outcome of a provider call should count against the
    /// provider's breaker. Client-side rejections mean the provider is up.
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self {
            Self::Provider { permanent, .. } => !permanent,
            Self::Validation(_) => false,
            _ => true,
        }
    }

    /// Short machine-readable code for events and API bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::RateLimitExceeded(_) => "rate_limit_exceeded",
            Self::CircuitOpen(_) => "circuit_open",
            Self::TooManyRequests(_) => "too_many_requests",
            Self::Provider { .. } => "provider_error",
            Self::Timeout { .. } => "timeout",
            Self::Persistence(_) => "persistence_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Publish(_) => "publish_error",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition(_) | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen(_) | Self::TooManyRequests(_) | Self::Timeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}

impl From<validator::ValidationErrors> for NotificationError {
    fn from(err: validator::ValidationErrors) -> Self {
        NotificationError::Validation(err.to_string())
    }
}

impl From<sea_orm::DbErr> for NotificationError {
    fn from(err: sea_orm::DbErr) -> Self {
        NotificationError::Persistence(format!("Database error: {}", err))
    }
}

impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Publish(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<core_config::ConfigError> for NotificationError {
    fn from(err: core_config::ConfigError) -> Self {
        NotificationError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(NotificationError::CircuitOpen("sendgrid".into()).is_transient());
        assert!(NotificationError::RateLimitExceeded("email".into()).is_transient());
        assert!(NotificationError::provider("twilio", "503", false).is_transient());
        assert!(!NotificationError::provider("twilio", "400", true).is_transient());
        assert!(!NotificationError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn test_breaker_failure_classification() {
        assert!(NotificationError::provider("fcm", "502", false).counts_as_breaker_failure());
        assert!(!NotificationError::provider("fcm", "400", true).counts_as_breaker_failure());
        assert!(
            NotificationError::Timeout {
                operation: "send".into(),
                millis: 10
            }
            .counts_as_breaker_failure()
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            NotificationError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NotificationError::NotFound(Uuid::nil()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            NotificationError::InvalidTransition("read -> read".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            NotificationError::Conflict(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            NotificationError::Persistence("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
