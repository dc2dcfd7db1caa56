//! Outbound notification channel
//!
//! Explicit message-passing surface for community/ops notification,
//! decoupled from logging. Critical violations, rollback outcomes, and
//! breaker transitions always go through a [`Notifier`]; `tracing` only
//! records delivery failures.

use crate::contracts::{GuardianEvent, Notification};
use std::time::Duration;
use tokio::sync::mpsc;

/// Capability interface for the notification hook
pub trait Notifier: Send + Sync {
    /// Deliver one event. Delivery is best-effort; implementations must
    /// not panic or block the monitoring loop indefinitely.
    fn notify(
        &self,
        event: GuardianEvent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
}

/// Drops every event. Injected in tests that do not assert on delivery.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(
        &self,
        _event: GuardianEvent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Fans events out to an in-process subscriber over a bounded channel
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier and its subscriber end
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(
        &self,
        event: GuardianEvent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            let notification = Notification::from_event(event);
            if let Err(e) = tx.try_send(notification) {
                tracing::warn!(error = %e, "notification channel full or closed, event dropped");
            }
        })
    }
}

/// Posts notification envelopes to a webhook collaborator
pub struct WebhookNotifier {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(5000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Notifier for WebhookNotifier {
    fn notify(
        &self,
        event: GuardianEvent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        let notification = Notification::from_event(event);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let result = client
                .post(&endpoint)
                .json(&notification)
                .timeout(timeout)
                .send()
                .await;

            match result {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        status = response.status().as_u16(),
                        event = notification.event.kind(),
                        "notification webhook returned non-success"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        event = notification.event.kind(),
                        "notification webhook delivery failed"
                    );
                }
                _ => {}
            }
        })
    }
}
