//! Periodic pending and retry sweeps.

use crate::config::SweepConfig;
use crate::engine::DeliveryEngine;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Runs both sweeps on a fixed interval until shutdown.
///
/// Ticks that fall behind are delayed rather than bunched up, so a slow
/// sweep never causes a burst of back-to-back sweeps.
pub struct Sweeper {
    engine: Arc<DeliveryEngine>,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(engine: Arc<DeliveryEngine>, config: SweepConfig) -> Self {
        Self { engine, config }
    }

    /// One pass of both sweeps. Store errors are logged and the next tick
    /// tries again.
    pub async fn tick(&self) {
        match self.engine.sweep_pending(self.config.pending_batch).await {
            Ok(report) => debug!(?report, "Pending sweep"),
            Err(e) => warn!(error = %e, "Pending sweep failed"),
        }
        match self.engine.sweep_retries(self.config.retry_batch).await {
            Ok(report) => debug!(?report, "Retry sweep"),
            Err(e) => warn!(error = %e, "Retry sweep failed"),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            pending_batch = self.config.pending_batch,
            retry_batch = self.config.retry_batch,
            "Sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sweeper stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::events::LoggingPublisher;
    use crate::models::{Channel, CreateNotification, Notification, NotificationStatus};
    use crate::providers::{MockProvider, ProviderSet};
    use crate::repository::{InMemoryNotificationRepository, NotificationRepository};
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_picks_up_pending_until_shutdown() {
        let repository = InMemoryNotificationRepository::new();
        let provider = Arc::new(MockProvider::new("in_app", Channel::InApp));
        let engine = Arc::new(DeliveryEngine::new(
            Arc::new(repository.clone()),
            Arc::new(LoggingPublisher),
            ProviderSet::new().with(provider.clone()),
            DeliveryConfig::default(),
        ));

        // Inserted behind the engine's back, so only a sweep can find it.
        let n = Notification::new(
            CreateNotification::new("tenant-a", Channel::InApp, "user-1", "hi"),
            Utc::now(),
        );
        repository.create(&n).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = Sweeper::new(
            engine.clone(),
            SweepConfig::default().with_interval(Duration::from_secs(30)),
        )
        .spawn(rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stored = repository.get_by_id(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert_eq!(provider.calls(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
