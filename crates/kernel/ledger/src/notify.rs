use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// "Something up to `sequence` is committed." Carries no event data:
/// receivers re-read the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceNotice {
    pub sequence: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub uuid::Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

struct Subscription {
    id: SubscriptionId,
    sender: mpsc::Sender<SequenceNotice>,
}

/// Best-effort fan-out of new-sequence notices.
///
/// Each subscriber has a bounded channel. A full channel drops the notice
/// (the subscriber catches up from the ledger anyway); a closed one is
/// pruned.
pub struct SequenceNotifier {
    capacity: usize,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl SequenceNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<SequenceNotice>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = SubscriptionId::new();
        self.subscriptions
            .write()
            .await
            .push(Subscription { id, sender });
        debug!(subscription_id = %id.0, "Sequence subscription registered");
        (id, receiver)
    }

    /// Returns the number of subscribers that received the notice.
    pub async fn notify(&self, notice: SequenceNotice) -> usize {
        let subs = self.subscriptions.read().await;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for sub in subs.iter() {
            match sub.sender.try_send(notice) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscription_id = %sub.id.0,
                        sequence = notice.sequence,
                        "Subscriber channel full, dropping notice"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub.id),
            }
        }
        drop(subs);

        if !closed.is_empty() {
            let mut subs = self.subscriptions.write().await;
            subs.retain(|s| !closed.contains(&s.id));
            debug!(removed = closed.len(), "Cleaned up closed subscriptions");
        }
        delivered
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.write().await.retain(|s| s.id != id);
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let notifier = SequenceNotifier::new(8);
        let (_id, mut rx) = notifier.subscribe().await;
        assert_eq!(notifier.notify(SequenceNotice { sequence: 3 }).await, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn full_channel_drops_notice() {
        let notifier = SequenceNotifier::new(1);
        let (_id, mut rx) = notifier.subscribe().await;
        assert_eq!(notifier.notify(SequenceNotice { sequence: 1 }).await, 1);
        assert_eq!(notifier.notify(SequenceNotice { sequence: 2 }).await, 0);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_cleaned_up() {
        let notifier = SequenceNotifier::new(8);
        let (_id, rx) = notifier.subscribe().await;
        let (id2, _rx2) = notifier.subscribe().await;
        drop(rx);
        notifier.notify(SequenceNotice { sequence: 0 }).await;
        assert_eq!(notifier.subscription_count().await, 1);
        notifier.unsubscribe(id2).await;
        assert_eq!(notifier.subscription_count().await, 0);
    }
}
