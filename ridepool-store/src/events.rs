use async_trait::async_trait;
use ridepool_core::{Notifier, NotifyError};
use ridepool_shared::NotificationEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// In-process fan-out of booking notifications. Delivery adapters subscribe.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<NotificationEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, event: NotificationEvent) -> Result<(), NotifyError> {
        let topic = event.topic();
        let key = event.key();
        match self.tx.send(event) {
            Ok(receivers) => debug!(topic, %key, receivers, "Notification published"),
            // Nobody listening is not a failure.
            Err(_) => debug!(topic, %key, "Notification dropped, no subscribers"),
        }
        Ok(())
    }
}
