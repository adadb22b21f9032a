//! Transition notifications
//!
//! Committed transitions are published on a broadcast channel. Publishing
//! never blocks and never fails the transition; slow subscribers lag and
//! lose events rather than applying backpressure.

use crate::audit::AuditEvent;
use crate::error::NotifyError;
use crate::types::{FailureCategory, Fingerprint};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A committed transition plus the context adapters usually need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub audit: AuditEvent,
    pub fingerprint: Fingerprint,
    pub category: FailureCategory,
}

/// Outbound adapter (chat, ticketing, paging)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &TransitionEvent) -> Result<(), NotifyError>;
}

/// Fan-out of transition events
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<TransitionEvent>,
}

impl Notifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.sender.subscribe()
    }

    /// Publish a committed transition; having no subscribers is not an error
    pub fn on_transition(&self, event: TransitionEvent) {
        let _ = self.sender.send(event);
    }

    /// Feed `sink` from a background task until the notifier is dropped
    pub fn attach(&self, sink: Arc<dyn NotificationSink>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = sink.deliver(&event).await {
                            warn!(incident_id = %event.audit.incident_id, error = %e, "notification delivery failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification sink lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Built-in sink that logs each transition
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
        let audit = &event.audit;
        info!(
            target: "remedy::notify",
            incident_id = %audit.incident_id,
            fingerprint = %event.fingerprint,
            category = %event.category,
            from = audit.from_state.map_or("-", |s| s.as_str()),
            to = %audit.to_state,
            reason = %audit.reason,
            attempt = audit.attempt_number,
            detail = audit.detail.as_deref().unwrap_or(""),
            "incident transition"
        );
        Ok(())
    }
}
