//! Broadcast hub — fans build messages out to realtime subscribers.
//!
//! Each subscriber reads from its own cursor into a bounded
//! `tokio::sync::broadcast` ring. Publishing never waits on a reader. A
//! subscriber that falls more than `capacity` messages behind loses its
//! oldest undelivered messages and continues from the oldest one still
//! retained; nobody else notices. The ring capacity is rounded up to a
//! power of two.
//!
//! A [`Subscription`] unregisters itself when dropped.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::events::build::BroadcastMessage;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub struct BroadcastHub {
    sender: broadcast::Sender<BroadcastMessage>,
    subscribers: Mutex<HashMap<String, CancellationToken>>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new subscriber. Its queue starts with the identity message.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = new_subscriber_id();
        let closed = CancellationToken::new();
        let receiver = self.sender.subscribe();

        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id.clone(), closed.clone());
            subscribers.len()
        };
        crate::metrics::realtime_subscribers(count);
        tracing::debug!(subscriber_id = %id, "Subscriber registered");

        Subscription {
            identity: Some(BroadcastMessage::identity(id.clone())),
            id,
            receiver,
            closed,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove a subscriber and close its queue. Unknown ids are ignored.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        let (removed, count) = {
            let mut subscribers = self.subscribers.lock();
            let removed = subscribers.remove(subscriber_id);
            (removed, subscribers.len())
        };

        if let Some(closed) = removed {
            closed.cancel();
            crate::metrics::realtime_subscribers(count);
            tracing::debug!(subscriber_id, "Subscriber removed");
        }
    }

    /// Deliver a message to every live subscriber queue.
    ///
    /// Returns the number of queues the message was written to.
    pub fn publish(&self, message: BroadcastMessage) -> usize {
        // send() only fails when no receiver exists
        self.sender.send(message).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// One subscriber's delivery queue.
pub struct Subscription {
    id: String,
    identity: Option<BroadcastMessage>,
    receiver: broadcast::Receiver<BroadcastMessage>,
    closed: CancellationToken,
    hub: Weak<BroadcastHub>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next message in publish order, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        if let Some(identity) = self.identity.take() {
            return Some(identity);
        }

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                received = self.receiver.recv() => match received {
                    Ok(message) => return Some(message),
                    Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<BroadcastMessage> {
        if let Some(identity) = self.identity.take() {
            return Some(identity);
        }
        if self.closed.is_cancelled() {
            return None;
        }

        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(_) => return None,
            }
        }
    }

    fn record_lag(&self, skipped: u64) {
        tracing::warn!(
            subscriber_id = %self.id,
            skipped,
            "Slow subscriber, dropped oldest messages"
        );
        crate::metrics::realtime_messages_dropped(skipped);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.id);
        }
    }
}

/// 12 random bytes, hex encoded.
fn new_subscriber_id() -> String {
    hex::encode(rand::random::<[u8; 12]>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::build::BroadcastKind;

    fn output(event_id: u64, n: usize) -> BroadcastMessage {
        BroadcastMessage::output_appended(event_id, format!("line {n}"))
    }

    fn fragment(message: BroadcastMessage) -> String {
        match message.kind {
            BroadcastKind::OutputAppended { fragment } => fragment,
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn identity_comes_first() {
        let hub = Arc::new(BroadcastHub::new(8));
        let mut sub = hub.subscribe();
        hub.publish(output(1, 0));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_id, 0);
        assert_eq!(
            first.kind,
            BroadcastKind::Identity {
                subscriber_id: sub.id().to_string()
            }
        );
        assert_eq!(sub.id().len(), 24);
        assert_eq!(fragment(sub.recv().await.unwrap()), "line 0");
    }

    #[tokio::test]
    async fn fan_out_preserves_publish_order() {
        let hub = Arc::new(BroadcastHub::new(64));
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        a.recv().await;
        b.recv().await;

        for n in 0..20 {
            hub.publish(output(1, n));
        }

        for sub in [&mut a, &mut b] {
            for n in 0..20 {
                assert_eq!(fragment(sub.recv().await.unwrap()), format!("line {n}"));
            }
        }
    }

    #[tokio::test]
    async fn saturated_subscriber_does_not_affect_others() {
        let hub = Arc::new(BroadcastHub::new(4));
        let mut fast = hub.subscribe();
        let mut slow = hub.subscribe();
        fast.recv().await;
        slow.recv().await;

        for n in 0..50 {
            assert_eq!(hub.publish(output(9, n)), 2);
            assert_eq!(fragment(fast.recv().await.unwrap()), format!("line {n}"));
        }

        // the slow reader keeps only the newest `capacity` messages
        let kept: Vec<String> = std::iter::from_fn(|| slow.try_recv()).map(fragment).collect();
        assert_eq!(kept, vec!["line 46", "line 47", "line 48", "line 49"]);
    }

    #[tokio::test]
    async fn unsubscribe_closes_queue_and_is_idempotent() {
        let hub = Arc::new(BroadcastHub::new(8));
        let mut sub = hub.subscribe();
        let id = sub.id().to_string();
        assert_eq!(hub.subscriber_count(), 1);

        hub.unsubscribe(&id);
        hub.unsubscribe(&id);
        assert_eq!(hub.subscriber_count(), 0);

        sub.recv().await; // identity
        hub.publish(output(1, 0));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let hub = Arc::new(BroadcastHub::new(2));
        assert_eq!(hub.publish(output(1, 0)), 0);

        let sub = hub.subscribe();
        let id = sub.id().to_string();
        drop(sub);
        assert_eq!(hub.publish(output(1, 1)), 0);
        assert_eq!(hub.subscriber_count(), 0);
        hub.unsubscribe(&id);
    }

    #[tokio::test]
    async fn dropped_subscription_leaves_the_registry() {
        let hub = Arc::new(BroadcastHub::new(8));
        let kept = hub.subscribe();
        {
            let _gone = hub.subscribe();
            assert_eq!(hub.subscriber_count(), 2);
        }
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.publish(output(1, 0)), 1);
        drop(kept);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn subscriber_ids_are_random_hex() {
        let hub = Arc::new(BroadcastHub::new(2));
        let ids: Vec<String> = (0..32).map(|_| hub.subscribe().id().to_string()).collect();
        for id in &ids {
            assert_eq!(id.len(), 24);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
