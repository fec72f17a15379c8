//! Recipient format checks per channel.

use crate::error::{NotificationError, NotificationResult};
use crate::models::{Channel, CreateNotification};
use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$").unwrap()
});

/// E.164: `+`, a non-zero country digit, up to 15 digits total
static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+[1-9]\d{6,14}$").unwrap());

pub const MIN_PUSH_TOKEN_LEN: usize = 16;

/// Check `recipient` against the format expected for `channel`.
pub fn validate_recipient(channel: Channel, recipient: &str) -> Result<(), ValidationError> {
    let recipient = recipient.trim();
    let (valid, code, message) = match channel {
        Channel::Email => (
            EMAIL.is_match(recipient),
            "invalid_email",
            "recipient must be a valid email address",
        ),
        Channel::Sms => (
            PHONE.is_match(recipient),
            "invalid_phone",
            "recipient must be an E.164 phone number",
        ),
        Channel::Push => (
            recipient.len() >= MIN_PUSH_TOKEN_LEN && !recipient.contains(char::is_whitespace),
            "invalid_device_token",
            "recipient must be a device token",
        ),
        Channel::Webhook => (
            is_http_url(recipient),
            "invalid_webhook_url",
            "recipient must be an http(s):// URL",
        ),
        Channel::InApp => (
            !recipient.is_empty(),
            "invalid_in_app_recipient",
            "recipient must identify an in-app inbox",
        ),
    };

    if valid {
        Ok(())
    } else {
        Err(ValidationError::new(code).with_message(Cow::Borrowed(message)))
    }
}

fn is_http_url(value: &str) -> bool {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.starts_with('/'))
}

/// Struct-level check wired into `CreateNotification`'s derive
pub fn validate_create(input: &CreateNotification) -> Result<(), ValidationError> {
    if input.tenant_id.trim().is_empty() {
        return Err(ValidationError::new("missing_tenant")
            .with_message(Cow::Borrowed("tenant_id is required")));
    }
    if input.message.trim().is_empty() {
        return Err(ValidationError::new("missing_message")
            .with_message(Cow::Borrowed("message is required")));
    }
    validate_recipient(input.channel, &input.recipient)
}

/// Full submission validation, mapped into the domain error
pub fn validate_request(input: &CreateNotification) -> NotificationResult<()> {
    input
        .validate()
        .map_err(|e| NotificationError::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_recipients() {
        assert!(validate_recipient(Channel::Email, "user@example.com").is_ok());
        assert!(validate_recipient(Channel::Email, "first.last+tag@mail.example.co.uk").is_ok());
        assert!(validate_recipient(Channel::Email, "not-an-email").is_err());
        assert!(validate_recipient(Channel::Email, "user@localhost").is_err());
        assert!(validate_recipient(Channel::Email, "@example.com").is_err());
    }

    #[test]
    fn test_sms_recipients() {
        assert!(validate_recipient(Channel::Sms, "+14155552671").is_ok());
        assert!(validate_recipient(Channel::Sms, "14155552671").is_err());
        assert!(validate_recipient(Channel::Sms, "+0123456789").is_err());
        assert!(validate_recipient(Channel::Sms, "+1415555267112345").is_err());
    }

    #[test]
    fn test_push_and_webhook_recipients() {
        assert!(validate_recipient(Channel::Push, "fcm-token-abcdef0123456789").is_ok());
        assert!(validate_recipient(Channel::Push, "short").is_err());
        assert!(validate_recipient(Channel::Webhook, "https://hooks.example.com/a").is_ok());
        assert!(validate_recipient(Channel::Webhook, "http://10.0.0.1:8080").is_ok());
        assert!(validate_recipient(Channel::Webhook, "ftp://example.com").is_err());
        assert!(validate_recipient(Channel::Webhook, "https://").is_err());
    }

    #[test]
    fn test_validate_request_reports_channel_mismatch() {
        let input = CreateNotification::new("tenant-a", Channel::Email, "+14155552671", "hi");
        let err = validate_request(&input).unwrap_err();
        assert!(matches!(err, NotificationError::Validation(_)));
    }

    #[test]
    fn test_validate_request_requires_tenant_and_message() {
        let missing_tenant = CreateNotification::new("", Channel::InApp, "user-1", "hi");
        assert!(validate_request(&missing_tenant).is_err());

        let blank_message = CreateNotification::new("t", Channel::InApp, "user-1", "   ");
        assert!(validate_request(&blank_message).is_err());

        let ok = CreateNotification::new("t", Channel::InApp, "user-1", "hi");
        assert!(validate_request(&ok).is_ok());
    }
}
