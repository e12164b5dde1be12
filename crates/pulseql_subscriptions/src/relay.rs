//! Distributed topic relay.
//!
//! The relay owns every broker-level subscription in the process. One
//! broker subscription serves arbitrarily many local observers of the
//! same topic: the first local subscriber opens it and spawns the topic's
//! receive loop, later subscribers share it, and the last one to leave
//! closes it. Observers never touch the broker directly.

use std::sync::Arc;

use pulseql_protocol::{Decoded, MessageCodec, OperationMessage};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::broker::{BrokerSubscription, TopicBroker};
use crate::error::SubscriptionError;
use crate::observer::OperationObserver;

type TopicMap = Arc<Mutex<FxHashMap<String, TopicEntry>>>;

struct TopicEntry {
    subscribers: Arc<Mutex<Vec<OperationObserver>>>,
    task: JoinHandle<()>,
}

/// Bridges local observers to the distributed broker.
pub struct TopicRelay {
    codec: Arc<dyn MessageCodec>,
    broker: Arc<dyn TopicBroker>,
    topics: TopicMap,
}

impl TopicRelay {
    /// Creates a relay over `broker`, serializing through `codec`.
    pub fn new(broker: Arc<dyn TopicBroker>, codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            codec,
            broker,
            topics: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Publishes one event to `topic`, fanning out to every subscribed
    /// process.
    ///
    /// # Errors
    /// [`SubscriptionError::Publish`] when the broker cannot accept the
    /// event. The relay never retries: a stale event has no value once
    /// consumers have moved on, and the producer's next publish carries
    /// fresher state.
    pub async fn publish(
        &self,
        topic: &str,
        event: &serde_json::Value,
    ) -> Result<(), SubscriptionError> {
        let payload = self
            .codec
            .encode(event)
            .map_err(|error| SubscriptionError::Publish(error.to_string()))?;
        self.broker
            .publish(topic, payload)
            .await
            .map_err(|error| SubscriptionError::Publish(error.to_string()))
    }

    /// Publishes the completion sentinel: every observer bound to `topic`,
    /// in every process, receives a `Complete`.
    pub async fn publish_completion(&self, topic: &str) -> Result<(), SubscriptionError> {
        self.broker
            .publish(topic, self.codec.encode_completion())
            .await
            .map_err(|error| SubscriptionError::Publish(error.to_string()))
    }

    /// Registers `observer` for all future messages on `topic`.
    ///
    /// The first local subscriber opens the broker-level subscription and
    /// starts the topic's receive loop; later subscribers share it.
    ///
    /// # Errors
    /// [`SubscriptionError::Broker`] if the broker-level subscription
    /// cannot be opened. Only the requesting operation is affected.
    pub async fn subscribe(
        &self,
        topic: &str,
        observer: OperationObserver,
    ) -> Result<(), SubscriptionError> {
        let mut topics = self.topics.lock().await;

        if let Some(entry) = topics.get(topic) {
            entry.subscribers.lock().await.push(observer);
            return Ok(());
        }

        let subscription = self
            .broker
            .subscribe(topic)
            .await
            .map_err(|error| SubscriptionError::Broker(error.to_string()))?;

        let subscribers = Arc::new(Mutex::new(vec![observer]));
        let task = tokio::spawn(receive_loop(
            topic.to_string(),
            subscription,
            Arc::clone(&subscribers),
            Arc::clone(&self.codec),
            Arc::clone(&self.topics),
        ));
        topics.insert(topic.to_string(), TopicEntry { subscribers, task });
        Ok(())
    }

    /// Removes one local subscriber. Closing the broker subscription is
    /// deferred until the last local subscriber for the topic is gone.
    /// No-op if the observer was not subscribed.
    pub async fn unsubscribe(&self, topic: &str, observer: &OperationObserver) {
        let mut topics = self.topics.lock().await;
        let Some(entry) = topics.get(topic) else {
            return;
        };

        let mut subscribers = entry.subscribers.lock().await;
        subscribers.retain(|existing| !existing.ptr_eq(observer));
        let now_empty = subscribers.is_empty();
        drop(subscribers);

        if now_empty {
            if let Some(entry) = topics.remove(topic) {
                entry.task.abort();
            }
        }
    }

    /// True while a broker-level subscription for `topic` is open.
    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().await.contains_key(topic)
    }

    /// Number of local observers currently bound to `topic`.
    pub async fn local_subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().await;
        match topics.get(topic) {
            Some(entry) => entry.subscribers.lock().await.len(),
            None => 0,
        }
    }

    /// Number of topics with an open broker-level subscription.
    pub async fn topic_count(&self) -> usize {
        self.topics.lock().await.len()
    }
}

/// Per-topic receive loop: decodes broker payloads and fans them out to
/// the topic's local observers.
async fn receive_loop(
    topic: String,
    mut subscription: BrokerSubscription,
    subscribers: Arc<Mutex<Vec<OperationObserver>>>,
    codec: Arc<dyn MessageCodec>,
    topics: TopicMap,
) {
    loop {
        let Some(payload) = subscription.next().await else {
            // The broker dropped the subscription underneath us. Degrade
            // the topic: surface a terminal error so clients can react
            // instead of hanging silently.
            let stranded = close_topic(&topic, &topics, &subscribers).await;
            for observer in stranded {
                observer.fail(SubscriptionError::Broker(format!(
                    "subscription for topic `{topic}` closed unexpectedly"
                )));
            }
            return;
        };

        match codec.decode(&payload) {
            Err(error) => {
                // Malformed payloads are dropped, never fatal.
                warn!(topic = %topic, %error, "dropping undecodable broker payload");
            }
            Ok(Decoded::Completed) => {
                let finished = close_topic(&topic, &topics, &subscribers).await;

                // Concurrent like the event path: a consumer stalled on a
                // full buffer must not hold up its siblings' `Complete`.
                let mut deliveries = JoinSet::new();
                for observer in finished {
                    let topic = topic.clone();
                    deliveries.spawn(async move {
                        let message = OperationMessage::Complete {
                            id: observer.id().clone(),
                        };
                        if let Err(error) = observer.push(message).await {
                            debug!(
                                topic = %topic,
                                operation = %observer.id(),
                                %error,
                                "completion not delivered"
                            );
                        }
                    });
                }
                while deliveries.join_next().await.is_some() {}
                return;
            }
            Ok(Decoded::Event(event)) => {
                let snapshot: Vec<OperationObserver> = subscribers.lock().await.clone();
                if snapshot.is_empty() {
                    continue;
                }

                // Deliver to all local observers concurrently so one slow
                // consumer's backpressure cannot hold up its siblings. A
                // consumer that exceeds its stall timeout is failed and
                // evicted; the loop moves on to the next payload only
                // after this one is settled everywhere, preserving
                // per-subscriber order.
                let mut deliveries = JoinSet::new();
                for observer in snapshot {
                    let payload = event.clone();
                    deliveries.spawn(async move {
                        let message = OperationMessage::Data {
                            id: observer.id().clone(),
                            payload,
                        };
                        let result = observer.push(message).await;
                        (observer, result)
                    });
                }

                while let Some(joined) = deliveries.join_next().await {
                    let Ok((observer, result)) = joined else {
                        continue;
                    };
                    if let Err(error) = result {
                        warn!(
                            topic = %topic,
                            operation = %observer.id(),
                            %error,
                            "evicting subscriber from topic"
                        );
                        subscribers
                            .lock()
                            .await
                            .retain(|existing| !existing.ptr_eq(&observer));
                    }
                }
            }
        }
    }
}

/// Removes the topic's entry and drains its subscriber set. Performed
/// map-first so a racing `subscribe` either lands in the drained set or
/// opens a fresh broker subscription, never in a dead entry.
async fn close_topic(
    topic: &str,
    topics: &TopicMap,
    subscribers: &Arc<Mutex<Vec<OperationObserver>>>,
) -> Vec<OperationObserver> {
    topics.lock().await.remove(topic);
    let mut subscribers = subscribers.lock().await;
    subscribers.drain(..).collect()
}
