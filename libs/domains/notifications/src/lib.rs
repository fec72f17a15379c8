//! Notifications Domain
//!
//! Multi-tenant notification delivery over email, SMS, push, webhook and
//! in-app channels, with per-provider circuit breakers and per-key rate
//! limits in front of every provider call.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Caller      │  ← submit(CreateNotification)
//! └────────┬────────┘
//!          │ validate + persist as pending
//! ┌────────▼────────┐      ┌──────────────────┐
//! │ DeliveryEngine  │ ◄─── │ Sweeper          │  pending / retry sweeps
//! └────────┬────────┘      └──────────────────┘
//!          │ RateLimiter.allow(tenant:channel)
//!          │ CircuitBreaker.call(provider)
//! ┌────────▼────────┐
//! │ ChannelProvider │  ← SendGrid, Twilio, FCM, webhook, in-app
//! └────────┬────────┘
//!          │ mark sent / failed, persist once
//! ┌────────▼────────┐
//! │ EventPublisher  │  ← notification.created / sent / failed / read
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{
//!     CreateNotification, DeliveryConfig, DeliveryEngine, InMemoryNotificationRepository,
//!     LoggingPublisher, models::Channel, providers::{InAppHub, ProviderSet},
//! };
//!
//! let engine = Arc::new(DeliveryEngine::new(
//!     Arc::new(InMemoryNotificationRepository::new()),
//!     Arc::new(LoggingPublisher),
//!     ProviderSet::from_env(InAppHub::new(1024))?,
//!     DeliveryConfig::from_env()?,
//! ));
//!
//! let notification = engine
//!     .submit(CreateNotification::new("tenant-a", Channel::Email, "ada@example.com", "Hi"))
//!     .await?;
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod postgres;
pub mod providers;
pub mod repository;
pub mod sweeper;
pub mod validation;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BreakerSettings, ChannelSettings, DeliveryConfig, RetryPolicy, SweepConfig};
pub use engine::{DeliveryEngine, DispatchOutcome, SkipReason, SweepReport};
pub use error::{NotificationError, NotificationResult};
pub use events::{BroadcastPublisher, EventPublisher, LifecycleEvent, LoggingPublisher, RedisStreamPublisher};
pub use handlers::{AdminState, admin_router};
pub use models::{
    Channel, CreateNotification, Notification, NotificationStats, NotificationStatus, Priority,
};
pub use postgres::PgNotificationRepository;
pub use repository::{InMemoryNotificationRepository, NotificationRepository, Revision};
pub use sweeper::Sweeper;
