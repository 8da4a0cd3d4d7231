use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use ulid::Ulid;

const OUTBOX_CAPACITY: usize = 4096;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingCreated,
    PaymentUploaded,
    BookingApproved,
    BookingRejected,
    BookingCancelled,
    QueuePromoted,
    QueueCancelled,
}

impl NotificationKind {
    /// In-app delivery policy. Slip uploads are not echoed back to the uploader.
    pub fn delivered_in_app(&self) -> bool {
        !matches!(self, NotificationKind::PaymentUploaded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Delivery channel behind the outbox (in-app feed, mail, push...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Per-user broadcast feed for in-app notifications.
pub struct InAppHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for InAppHub {
    fn default() -> Self {
        Self::new()
    }
}

impl InAppHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a user's feed. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop a user's channel once their last receiver is gone. Other open
    /// sessions of the same user keep theirs.
    pub fn release(&self, user_id: &Ulid) {
        self.channels.remove_if(user_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl NotificationSink for InAppHub {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        // Nobody listening is not a failure.
        if let Some(sender) = self.channels.get(&notification.user_id) {
            let _ = sender.send(notification.clone());
        }
        Ok(())
    }
}

/// Post-commit outbox. `send` only enqueues; a background task delivers.
/// Delivery failures are logged and counted, never surfaced to the caller.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Spawn the dispatcher task. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        tokio::spawn(dispatch_loop(sink, rx));
        Self { tx }
    }

    pub fn send(&self, user_id: Ulid, kind: NotificationKind, payload: serde_json::Value) {
        let notification = Notification { user_id, kind, payload };
        if let Err(e) = self.tx.try_send(notification) {
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            warn!("notification dropped for user {user_id}: {e}");
        }
    }
}

async fn dispatch_loop(sink: Arc<dyn NotificationSink>, mut rx: mpsc::Receiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        if !notification.kind.delivered_in_app() {
            debug!("notification {:?} suppressed by policy", notification.kind);
            continue;
        }
        if let Err(e) = sink.deliver(&notification).await {
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            warn!(
                "notification {:?} to {} failed, booking unaffected: {e}",
                notification.kind, notification.user_id
            );
        }
    }
}
