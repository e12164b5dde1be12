//! The distributed pub/sub broker boundary.
//!
//! The relay talks to the broker only through [`TopicBroker`]: publish
//! bytes to a named topic, subscribe to a topic's byte stream. Delivery is
//! best-effort and in-order within one topic; nothing survives a restart.
//!
//! [`InMemoryBroker`] is the process-local implementation used by tests
//! and single-process deployments. External brokers (Redis, NATS, ...)
//! implement the same trait by pumping their native streams into a
//! [`BrokerSubscription`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::warn;

/// Errors from the broker boundary.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker connection is currently unavailable.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Opening a topic-level subscription failed.
    #[error("broker subscribe failed: {0}")]
    Subscribe(String),
}

/// A live broker-level subscription: an in-order stream of byte payloads
/// for one topic. Dropping it closes the subscription.
pub struct BrokerSubscription {
    rx: mpsc::Receiver<Bytes>,
}

impl BrokerSubscription {
    /// Wraps a receiver that a broker adapter pumps payloads into.
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Creates a subscription plus the sender half for the adapter.
    pub fn channel(buffer: usize) -> (Self, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(rx), tx)
    }

    /// Waits for the next payload; `None` once the broker side closed the
    /// subscription.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// The pub/sub store the relay fans out through.
#[async_trait]
pub trait TopicBroker: Send + Sync + 'static {
    /// Publishes one payload to `topic`. Best-effort: succeeding says the
    /// broker accepted the bytes, not that anyone received them.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Opens a subscription for `topic`.
    async fn subscribe(&self, topic: &str) -> Result<BrokerSubscription, BrokerError>;
}

/// Process-local broker backed by one `broadcast` channel per topic.
pub struct InMemoryBroker {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Bytes>>>>,
    capacity: usize,
}

impl InMemoryBroker {
    /// Creates a broker whose per-topic ring holds `capacity` payloads.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Number of live subscriptions for `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(topic)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    /// Drops topics that no longer have subscribers.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl TopicBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(topic) {
            // A send error means every subscriber vanished between lookup
            // and send; best-effort semantics make that a non-event.
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BrokerSubscription, BrokerError> {
        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        drop(channels);

        let mut source = sender.subscribe();
        let (subscription, tx) = BrokerSubscription::channel(self.capacity);
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = source.recv() => match result {
                        Ok(payload) => {
                            if tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "broker subscriber lagged, payloads dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    // Subscription dropped; unsubscribe promptly.
                    () = tx.closed() => break,
                }
            }
        });

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = InMemoryBroker::new(8);
        let mut sub = broker.subscribe("orders").await.unwrap();

        broker
            .publish("orders", Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(sub.next().await, Some(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let broker = InMemoryBroker::new(8);
        broker
            .publish("nobody", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count("nobody").await, 0);
    }

    #[tokio::test]
    async fn test_two_subscribers_both_receive() {
        let broker = InMemoryBroker::new(8);
        let mut a = broker.subscribe("t").await.unwrap();
        let mut b = broker.subscribe("t").await.unwrap();

        broker.publish("t", Bytes::from_static(b"e")).await.unwrap();

        assert_eq!(a.next().await, Some(Bytes::from_static(b"e")));
        assert_eq!(b.next().await, Some(Bytes::from_static(b"e")));
    }

    #[tokio::test]
    async fn test_in_order_within_topic() {
        let broker = InMemoryBroker::new(8);
        let mut sub = broker.subscribe("seq").await.unwrap();

        for n in 0..5u8 {
            broker.publish("seq", Bytes::from(vec![n])).await.unwrap();
        }
        for n in 0..5u8 {
            assert_eq!(sub.next().await, Some(Bytes::from(vec![n])));
        }
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_topics() {
        let broker = InMemoryBroker::new(8);
        {
            let _sub = broker.subscribe("gone").await.unwrap();
        }
        // The pump task notices the dropped subscription lazily; give it
        // a chance to exit before cleanup.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        broker.cleanup().await;
        let channels = broker.channels.read().await;
        assert!(!channels.contains_key("gone"));
    }
}
