//! Delivery metrics. Rendering goes through `resilience::metrics`, which owns
//! the Prometheus recorder.

use crate::models::Channel;
use metrics::{counter, histogram};
use std::time::Duration;

/// Result of one delivery attempt, as recorded on the attempts counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Sent,
    Failed,
    RateLimited,
    CircuitOpen,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

pub fn record_submitted(channel: Channel) {
    counter!("notification_submitted_total", "channel" => channel.as_str()).increment(1);
}

pub fn record_attempt(channel: Channel, outcome: AttemptOutcome, elapsed: Duration) {
    counter!(
        "notification_delivery_attempts_total",
        "channel" => channel.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!("notification_delivery_duration_seconds", "channel" => channel.as_str())
        .record(elapsed.as_secs_f64());
}

pub fn record_sweep_selected(sweep: &'static str, selected: usize) {
    counter!("notification_sweep_selected_total", "sweep" => sweep).increment(selected as u64);
}
