//! Push notifications: subscription store, trigger pipeline, delivery.

pub mod store;
pub mod triggers;
pub mod vapid;
pub mod visibility;
pub mod webpush;

use std::collections::HashSet;
use std::sync::Arc;

use openchamber_protocol::PushPayload;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use store::{PushSubscription, SubscriptionStore};
pub use triggers::{spawn_triggers, Notification, TriggerConfig};
pub use visibility::VisibilityTracker;
pub use webpush::{PushSender, WebPushSender};

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push endpoint is gone (status {0})")]
    Gone(u16),
    #[error("push service rejected the message (status {0})")]
    Rejected(u16),
    #[error("push transport error: {0}")]
    Transport(String),
    #[error("failed to build push message: {0}")]
    Encoding(String),
    #[error("VAPID key error: {0}")]
    Vapid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub require_no_sse: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub pruned: usize,
    pub failed: usize,
    pub suppressed: bool,
}

pub struct PushDispatcher {
    store: Arc<SubscriptionStore>,
    sender: Arc<dyn PushSender>,
    visibility: Arc<VisibilityTracker>,
}

impl PushDispatcher {
    pub fn new(
        store: Arc<SubscriptionStore>,
        sender: Arc<dyn PushSender>,
        visibility: Arc<VisibilityTracker>,
    ) -> Self {
        Self {
            store,
            sender,
            visibility,
        }
    }

    /// Deliver to one subscription, pruning it everywhere if the push
    /// service reports it gone.
    pub async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<(), PushError> {
        let body = serde_json::to_vec(payload)?;
        match self.sender.send(subscription, &body).await {
            Err(PushError::Gone(status)) => {
                info!(
                    component = "push",
                    event = "push.endpoint.gone",
                    endpoint = %subscription.endpoint,
                    status,
                    "Pruning expired push endpoint"
                );
                self.store.remove_endpoint(&subscription.endpoint).await?;
                Err(PushError::Gone(status))
            }
            other => other,
        }
    }

    pub async fn send_to_all(&self, payload: &PushPayload, options: SendOptions) -> DispatchReport {
        let mut report = DispatchReport::default();
        if options.require_no_sse && self.visibility.any_visible() {
            debug!(
                component = "push",
                event = "push.send.suppressed",
                tag = %payload.tag,
            );
            report.suppressed = true;
            return report;
        }

        let subscriptions = match self.store.unique().await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                warn!(
                    component = "push",
                    event = "push.store.read_failed",
                    error = %err,
                );
                return report;
            }
        };

        let mut seen = HashSet::new();
        for subscription in subscriptions
            .iter()
            .filter(|s| seen.insert(s.endpoint.as_str()))
        {
            match self.send(subscription, payload).await {
                Ok(()) => report.sent += 1,
                Err(PushError::Gone(_)) => report.pruned += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        component = "push",
                        event = "push.send.failed",
                        endpoint = %subscription.endpoint,
                        error = %err,
                    );
                }
            }
        }
        report
    }
}

/// Deliver trigger output until the channel closes.
pub fn spawn_delivery(
    dispatcher: Arc<PushDispatcher>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            let dispatcher = Arc::clone(&dispatcher);
            // Slow push services must not hold up later notifications.
            tokio::spawn(async move {
                let report = dispatcher
                    .send_to_all(
                        &notification.payload,
                        SendOptions {
                            require_no_sse: notification.require_no_sse,
                        },
                    )
                    .await;
                debug!(
                    component = "push",
                    event = "push.delivery.completed",
                    tag = %notification.payload.tag,
                    sent = report.sent,
                    pruned = report.pruned,
                    failed = report.failed,
                    suppressed = report.suppressed,
                );
            });
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{PushError, PushSender, PushSubscription};

    /// Records deliveries; endpoints containing "gone" answer 410.
    #[derive(Default)]
    pub struct RecordingSender {
        pub delivered: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl PushSender for RecordingSender {
        async fn send(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
            if subscription.endpoint.contains("gone") {
                return Err(PushError::Gone(410));
            }
            let json = serde_json::from_slice(payload)?;
            self.delivered
                .lock()
                .unwrap()
                .push((subscription.endpoint.clone(), json));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSender;
    use super::*;
    use openchamber_protocol::{NotificationKind, SubscriptionKeys};

    fn keys() -> SubscriptionKeys {
        SubscriptionKeys {
            p256dh: "k".into(),
            auth: "a".into(),
        }
    }

    async fn fixture() -> (
        tempfile::TempDir,
        Arc<SubscriptionStore>,
        Arc<RecordingSender>,
        Arc<VisibilityTracker>,
        PushDispatcher,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SubscriptionStore::new(dir.path().join("push.json")));
        let sender = Arc::new(RecordingSender::default());
        let visibility = Arc::new(VisibilityTracker::new());
        let dispatcher = PushDispatcher::new(store.clone(), sender.clone(), visibility.clone());
        (dir, store, sender, visibility, dispatcher)
    }

    #[tokio::test]
    async fn shared_endpoint_is_sent_once_and_gone_is_pruned_everywhere() {
        let (_dir, store, sender, _visibility, dispatcher) = fixture().await;
        store.subscribe("a", "https://push/shared", keys()).await.unwrap();
        store.subscribe("b", "https://push/shared", keys()).await.unwrap();
        store.subscribe("a", "https://push/gone-1", keys()).await.unwrap();
        store.subscribe("b", "https://push/gone-1", keys()).await.unwrap();

        let payload = PushPayload::for_session(NotificationKind::Question, "s1", "Input needed", "?");
        let report = dispatcher.send_to_all(&payload, SendOptions::default()).await;

        assert_eq!(report.sent, 1);
        assert_eq!(report.pruned, 1);
        let delivered = sender.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1["data"]["type"], "question");
        assert_eq!(delivered[0].1["data"]["sessionId"], "s1");

        let remaining = store.unique().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].endpoint, "https://push/shared");
    }

    #[tokio::test]
    async fn passive_notifications_skip_while_foregrounded() {
        let (_dir, store, sender, visibility, dispatcher) = fixture().await;
        store.subscribe("a", "https://push/1", keys()).await.unwrap();
        visibility.report("a", true);

        let payload = PushPayload::for_session(NotificationKind::Ready, "s1", "Response ready", "");
        let report = dispatcher
            .send_to_all(&payload, SendOptions { require_no_sse: true })
            .await;
        assert!(report.suppressed);
        assert!(sender.delivered.lock().unwrap().is_empty());

        visibility.report("a", false);
        let report = dispatcher
            .send_to_all(&payload, SendOptions { require_no_sse: true })
            .await;
        assert_eq!(report.sent, 1);
    }
}
