use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// One [`CircuitBreaker`] per provider, created on first use.
///
/// Owned by whoever dispatches provider calls and shared by `Arc`; there is
/// no process-wide instance.
pub struct BreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl BreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Use `config` instead of the defaults for the breaker named `provider`.
    /// Only affects breakers not yet created.
    pub fn with_override(mut self, provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(provider.into(), config);
        self
    }

    pub fn config_for(&self, provider: &str) -> &CircuitBreakerConfig {
        self.overrides.get(provider).unwrap_or(&self.defaults)
    }

    /// Breaker for `provider`, creating it if this is the first reference.
    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(provider) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        // Another caller may have created it between the two locks.
        breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = provider, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(provider, self.config_for(provider).clone()))
            })
            .clone()
    }

    /// Existing breaker, without creating one.
    pub fn find(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(provider).cloned()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset one breaker. Returns false if no breaker with that name exists.
    pub fn reset(&self, provider: &str) -> bool {
        match self.find(provider) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker, returning how many were reset.
    pub fn reset_all(&self) -> usize {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        for breaker in &breakers {
            breaker.reset();
        }
        breakers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::error::BreakerError;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_registry_creates_once_per_provider() {
        let registry = BreakerRegistry::default();
        assert!(registry.is_empty());

        let a = registry.get("sendgrid");
        let b = registry.get("sendgrid");
        let c = registry.get("twilio");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_concurrent_get_returns_same_instance() {
        let registry = Arc::new(BreakerRegistry::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.get("fcm") }));
        }

        let first = registry.get("fcm");
        for handle in handles {
            assert!(Arc::ptr_eq(&first, &handle.await.unwrap()));
        }
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_applies_overrides() {
        let registry = BreakerRegistry::default().with_override(
            "twilio",
            CircuitBreakerConfig::default()
                .with_consecutive_failures(0)
                .with_timeout(Duration::from_secs(5)),
        );

        assert_eq!(registry.get("sendgrid").config().timeout, Duration::from_secs(60));
        let twilio = registry.get("twilio");
        assert_eq!(twilio.config().timeout, Duration::from_secs(5));

        let _ = twilio.call(|| async { Err::<(), _>("down") }).await;
        assert_eq!(twilio.state(), CircuitState::Open);
        assert_eq!(registry.get("sendgrid").state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_snapshot_and_reset() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default().with_consecutive_failures(0));
        let webhook = registry.get("webhook");
        registry.get("sendgrid");

        let result = webhook.call(|| async { Err::<(), _>("down") }).await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "sendgrid");
        assert_eq!(snapshot[1].name, "webhook");
        assert_eq!(snapshot[1].state, CircuitState::Open);

        assert!(registry.reset("webhook"));
        assert!(!registry.reset("unknown"));
        assert_eq!(webhook.state(), CircuitState::Closed);
        assert_eq!(registry.reset_all(), 2);
        assert!(registry.find("unknown").is_none());
    }
}
