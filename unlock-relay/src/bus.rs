//! In-process publish/subscribe fanout for relay envelopes.
//!
//! `publish` is synchronous: it walks the current subscribers, hands a copy
//! of the envelope to every subscriber whose predicate matches, and returns.
//! Each subscriber has a bounded buffer; when it is full the envelope is
//! dropped for that subscriber only, so a slow consumer never blocks the
//! publisher. Envelopes published while nobody matches are lost.

use dashmap::DashMap;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use unlock_types::MessageEnvelope;

type Predicate = Box<dyn Fn(&MessageEnvelope) -> bool + Send + Sync>;

struct Subscriber {
    predicate: Predicate,
    sender: mpsc::Sender<MessageEnvelope>,
}

/// Event bus shared by the relay endpoint, the reaper, and connection tasks.
pub struct EventBus {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    buffer_size: usize,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("buffer_size", &self.buffer_size)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventBus {
    /// Create a bus whose subscribers buffer up to `buffer_size` envelopes.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
            buffer_size: buffer_size.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, predicate: F) -> Subscription
    where
        F: Fn(&MessageEnvelope) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        self.subscribers.insert(
            id,
            Subscriber {
                predicate: Box::new(predicate),
                sender,
            },
        );

        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(self),
        }
    }

    /// Deliver `envelope` to every matching subscriber.
    ///
    /// Returns how many subscribers accepted it. Zero is not an error.
    pub fn publish(&self, envelope: MessageEnvelope) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !(subscriber.predicate)(&envelope) {
                continue;
            }
            match subscriber.sender.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "Subscriber {} lagging, dropped {:?} for user {}",
                        entry.key(),
                        envelope.kind,
                        envelope.source_user_id
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        // Removal happens after iteration; removing while holding a shard
        // read guard would deadlock.
        for id in closed {
            self.subscribers.remove(&id);
        }

        delivered
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Envelopes dropped because a subscriber buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }
}

/// Handle to a bus subscription; a lazy sequence of matching envelopes.
///
/// Dropping the handle unregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<MessageEnvelope>,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Wait for the next matching envelope.
    ///
    /// Returns `None` once the bus itself has been dropped.
    pub async fn recv(&mut self) -> Option<MessageEnvelope> {
        self.receiver.recv().await
    }

    /// Take an envelope if one is already buffered.
    pub fn try_recv(&mut self) -> Option<MessageEnvelope> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = MessageEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use unlock_types::{DeviceId, EnvelopeKind, UserId};

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn device(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn request_to(target: &str, n: u32) -> MessageEnvelope {
        MessageEnvelope::targeted(
            user("u1"),
            device(target),
            EnvelopeKind::ApprovalRequested,
            json!({ "n": n }),
        )
    }

    #[tokio::test]
    async fn publish_reaches_only_matching_subscribers() {
        let bus = Arc::new(EventBus::new(8));
        let d1 = device("d1");
        let mut to_d1 = bus.subscribe(move |env| env.is_addressed_to(&d1));
        let d2 = device("d2");
        let mut to_d2 = bus.subscribe(move |env| env.is_addressed_to(&d2));

        assert_eq!(bus.publish(request_to("d1", 1)), 1);

        assert_eq!(to_d1.recv().await.unwrap().payload["n"], 1);
        assert!(to_d2.try_recv().is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = Arc::new(EventBus::new(8));
        assert_eq!(bus.publish(request_to("ghost", 1)), 0);
    }

    #[tokio::test]
    async fn single_publisher_order_is_preserved() {
        let bus = Arc::new(EventBus::new(16));
        let mut sub = bus.subscribe(|_| true);

        for n in 0..10 {
            bus.publish(request_to("d1", n));
        }
        for n in 0..10 {
            assert_eq!(sub.recv().await.unwrap().payload["n"], n);
        }
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking() {
        let bus = Arc::new(EventBus::new(2));
        let mut slow = bus.subscribe(|_| true);

        assert_eq!(bus.publish(request_to("d1", 1)), 1);
        assert_eq!(bus.publish(request_to("d1", 2)), 1);
        assert_eq!(bus.publish(request_to("d1", 3)), 0);
        assert_eq!(bus.dropped_count(), 1);

        assert_eq!(slow.recv().await.unwrap().payload["n"], 1);
        assert_eq!(slow.recv().await.unwrap().payload["n"], 2);
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let bus = Arc::new(EventBus::new(8));
        let sub = bus.subscribe(|_| true);
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(request_to("d1", 1)), 0);
    }

    #[tokio::test]
    async fn concurrent_publish_and_subscribe() {
        let bus = Arc::new(EventBus::new(1024));
        let mut tasks = Vec::new();

        for _ in 0..4 {
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..100 {
                    bus.publish(request_to("d1", n));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for _ in 0..4 {
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let sub = bus.subscribe(|_| true);
                    tokio::task::yield_now().await;
                    drop(sub);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(bus.subscriber_count(), 0);
    }
}
