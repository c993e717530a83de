//! Fire-and-forget payment notifications.
//!
//! `notify` never blocks and never fails the caller; delivery problems are
//! logged and counted.

use crate::services::record_notification;
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentSucceeded,
    PaymentFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentSucceeded => "payment_succeeded",
            NotificationKind::PaymentFailed => "payment_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub subscription_id: Uuid,
    pub plan_name: String,
    pub amount: i64,
    pub currency: String,
    pub batch_code: String,
    pub reason: Option<String>,
    pub next_billing_date: Option<DateTime<Utc>>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

// =============================================================================
// Queued webhook delivery
// =============================================================================

/// Bounded queue drained by a background task that POSTs each message.
#[derive(Clone)]
pub struct QueuedNotifier {
    sender: mpsc::Sender<Notification>,
}

impl QueuedNotifier {
    /// Start the delivery task. It ends once every sender is dropped and
    /// the queue is drained.
    pub fn spawn(webhook_url: String, queue_size: usize, timeout: Duration) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default notification HTTP client");
                reqwest::Client::new()
            });

        let handle = tokio::spawn(deliver(client, webhook_url, receiver));
        (Self { sender }, handle)
    }
}

impl Notifier for QueuedNotifier {
    fn notify(&self, notification: Notification) {
        let kind = notification.kind.as_str();
        match self.sender.try_send(notification) {
            Ok(()) => record_notification(kind, "queued"),
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!(kind = kind, subscription_id = %n.subscription_id, "Notification queue full, dropping");
                record_notification(kind, "dropped");
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                warn!(kind = kind, subscription_id = %n.subscription_id, "Notification queue closed, dropping");
                record_notification(kind, "dropped");
            }
        }
    }
}

async fn deliver(
    client: reqwest::Client,
    webhook_url: String,
    mut receiver: mpsc::Receiver<Notification>,
) {
    let retry = RetryConfig::quick();

    while let Some(notification) = receiver.recv().await {
        let kind = notification.kind.as_str();
        let (client, url, payload) = (&client, webhook_url.as_str(), &notification);
        let result = retry_with_backoff(
            &retry,
            "notification_webhook",
            |_: &String| true,
            || async move {
                let response = client
                    .post(url)
                    .json(payload)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                response
                    .error_for_status()
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            },
        )
        .await;

        match result {
            Ok(()) => {
                debug!(kind = kind, subscription_id = %notification.subscription_id, "Notification delivered");
                record_notification(kind, "delivered");
            }
            Err(e) => {
                warn!(kind = kind, subscription_id = %notification.subscription_id, error = %e, "Notification delivery failed");
                record_notification(kind, "failed");
            }
        }
    }

    debug!("Notification queue drained");
}

// =============================================================================
// Log-only and recording notifiers
// =============================================================================

/// Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        info!(
            kind = notification.kind.as_str(),
            user_id = %notification.user_id,
            subscription_id = %notification.subscription_id,
            amount = notification.amount,
            currency = %notification.currency,
            "Payment notification"
        );
        record_notification(notification.kind.as_str(), "logged");
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(|n| n.kind == kind)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification(kind: NotificationKind) -> Notification {
        Notification {
            kind,
            user_id: Uuid::new_v4(),
            email: "angler@example.com".to_string(),
            name: Some("Ada".to_string()),
            subscription_id: Uuid::new_v4(),
            plan_name: "Pro".to_string(),
            amount: 1000,
            currency: "USD".to_string(),
            batch_code: "BATCH-20250301030000-ABCDEFGH".to_string(),
            reason: None,
            next_billing_date: None,
        }
    }

    #[tokio::test]
    async fn test_queued_notifier_posts_and_drains() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/billing"))
            .and(body_partial_json(serde_json::json!({"kind": "payment_succeeded", "amount": 1000})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (notifier, handle) = QueuedNotifier::spawn(
            format!("{}/hooks/billing", server.uri()),
            8,
            Duration::from_secs(2),
        );
        notifier.notify(notification(NotificationKind::PaymentSucceeded));
        drop(notifier);

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (sender, _receiver) = mpsc::channel(1);
        let notifier = QueuedNotifier { sender };

        notifier.notify(notification(NotificationKind::PaymentFailed));
        notifier.notify(notification(NotificationKind::PaymentFailed));

        assert_eq!(notifier.sender.capacity(), 0);
    }

    #[test]
    fn test_recording_notifier_filters_by_kind() {
        let notifier = RecordingNotifier::new();
        notifier.notify(notification(NotificationKind::PaymentSucceeded));
        notifier.notify(notification(NotificationKind::PaymentFailed));

        assert_eq!(notifier.notifications().len(), 2);
        assert_eq!(notifier.of_kind(NotificationKind::PaymentFailed).len(), 1);
    }
}
