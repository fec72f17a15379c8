//! Scriptable provider for tests and local runs.

use super::{ChannelProvider, OutboundMessage, ProviderError, Receipt};
use crate::models::Channel;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Provider that records what it was asked to send.
///
/// Outcomes come from the script first (one per call), then from the
/// failing/rejecting switch.
pub struct MockProvider {
    name: String,
    channel: Channel,
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    script: SyncMutex<VecDeque<Result<(), ProviderError>>>,
    failure: SyncMutex<Option<ProviderError>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: SyncMutex<HashSet<Uuid>>,
    overlapped: AtomicBool,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, channel: Channel) -> Self {
        Self {
            name: name.into(),
            channel,
            sent: Arc::new(Mutex::new(Vec::new())),
            script: SyncMutex::new(VecDeque::new()),
            failure: SyncMutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: SyncMutex::new(HashSet::new()),
            overlapped: AtomicBool::new(false),
        }
    }

    /// Always fails with a transient error
    pub fn failing(name: impl Into<String>, channel: Channel, message: impl Into<String>) -> Self {
        let provider = Self::new(name, channel);
        provider.set_failure(Some(ProviderError::transient(message)));
        provider
    }

    /// Always fails with a permanent error
    pub fn rejecting(name: impl Into<String>, channel: Channel, message: impl Into<String>) -> Self {
        let provider = Self::new(name, channel);
        provider.set_failure(Some(ProviderError::permanent(message)));
        provider
    }

    /// Sleep this long inside every send
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue outcomes for the next calls, in order
    pub fn with_outcomes(self, outcomes: impl IntoIterator<Item = Result<(), ProviderError>>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    /// Switch the fallback outcome; `None` means succeed.
    pub fn set_failure(&self, failure: Option<ProviderError>) {
        *self.failure.lock() = failure;
    }

    /// Number of times `send` was invoked, successful or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub async fn was_sent_to(&self, recipient: &str) -> bool {
        self.sent.lock().await.iter().any(|m| m.recipient == recipient)
    }

    /// True if `send` ever ran twice at the same time for one notification
    pub fn saw_overlapping_sends(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Result<(), ProviderError> {
        if let Some(outcome) = self.script.lock().pop_front() {
            return outcome;
        }
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Removes the id from the in-flight set even if the send is cancelled.
struct InFlightGuard<'a> {
    set: &'a SyncMutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

#[async_trait]
impl ChannelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.in_flight.lock().insert(message.notification_id) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            id: message.notification_id,
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.next_outcome()?;
        self.sent.lock().await.push(message.clone());
        Ok(Receipt {
            message_id: Some(format!("mock-{}", message.notification_id)),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
