//! Prometheus metrics for breakers and limiters
//!
//! The recorder is process-global; [`init_metrics`] installs it once and the
//! admin server renders it through [`render_metrics`].

use crate::circuit_breaker::CircuitState;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<PrometheusHandle, BuildError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format. Empty before [`init_metrics`].
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

pub(crate) fn record_transition(breaker: &str, to: CircuitState) {
    counter!(
        "circuit_breaker_transitions_total",
        "breaker" => breaker.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
    set_breaker_state(breaker, to);
}

pub(crate) fn set_breaker_state(breaker: &str, state: CircuitState) {
    gauge!("circuit_breaker_state", "breaker" => breaker.to_string()).set(state.as_gauge());
}

pub(crate) fn record_decision(limiter: &str, allowed: bool) {
    counter!(
        "rate_limiter_decisions_total",
        "limiter" => limiter.to_string(),
        "decision" => if allowed { "allowed" } else { "denied" }
    )
    .increment(1);
}

pub(crate) fn set_bucket_count(limiter: &str, buckets: usize) {
    gauge!("rate_limiter_buckets", "limiter" => limiter.to_string()).set(buckets as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        assert!(prometheus_handle().is_some());
    }

    #[test]
    fn test_recorded_metrics_render() {
        init_metrics().unwrap();
        record_transition("metrics-test", CircuitState::Open);
        record_decision("metrics-test", false);

        let rendered = render_metrics();
        assert!(rendered.contains("circuit_breaker_transitions_total"));
        assert!(rendered.contains("rate_limiter_decisions_total"));
    }
}
