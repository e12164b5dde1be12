//! Connection router: one per transport connection.
//!
//! Owns the connection's operation table and nothing else. Registration
//! and removal are serialized through one lock (single-writer
//! discipline); a failure on one operation never disturbs its siblings on
//! the same connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pulseql_protocol::{MessageCodec, OperationId};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SubscriptionConfig;
use crate::error::SubscriptionError;
use crate::observer::OperationObserver;
use crate::relay::TopicRelay;

struct Registration {
    observer: OperationObserver,
    topic: String,
}

/// Demultiplexes one connection's operations and ties each to a relay
/// subscription.
pub struct ConnectionRouter {
    relay: Arc<TopicRelay>,
    codec: Arc<dyn MessageCodec>,
    config: SubscriptionConfig,
    operations: Mutex<FxHashMap<OperationId, Registration>>,
    dropped_frames: AtomicU64,
}

impl ConnectionRouter {
    /// Creates a router over the shared relay.
    pub fn new(
        relay: Arc<TopicRelay>,
        codec: Arc<dyn MessageCodec>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            relay,
            codec,
            config,
            operations: Mutex::new(FxHashMap::default()),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Registers operation `id` on `topic` and returns its observer for
    /// the caller to drain into the transport.
    ///
    /// # Errors
    /// [`SubscriptionError::DuplicateOperation`] if `id` is still
    /// registered on this connection; the existing operation is left
    /// untouched. Relay/broker failures pass through and nothing is
    /// registered.
    pub async fn subscribe(
        &self,
        id: OperationId,
        topic: &str,
    ) -> Result<OperationObserver, SubscriptionError> {
        let mut operations = self.operations.lock().await;
        if operations.contains_key(&id) {
            return Err(SubscriptionError::DuplicateOperation(id));
        }

        let observer = OperationObserver::new(id.clone(), &self.config);
        self.relay.subscribe(topic, observer.clone()).await?;
        operations.insert(
            id,
            Registration {
                observer: observer.clone(),
                topic: topic.to_string(),
            },
        );
        Ok(observer)
    }

    /// Tears down operation `id`: disposes its observer and releases its
    /// relay subscription. Silent no-op when `id` is not registered:
    /// unsubscribe racing a completion is expected, not an error.
    pub async fn unsubscribe(&self, id: &OperationId) {
        let removed = self.operations.lock().await.remove(id);
        if let Some(registration) = removed {
            self.relay
                .unsubscribe(&registration.topic, &registration.observer)
                .await;
            registration.observer.dispose();
        }
    }

    /// Decodes one inbound transport frame and routes it.
    ///
    /// Operation-scoped frames go to the matching observer; frames for
    /// unknown ids are dropped and counted, since the producer may have
    /// completed or unsubscribed already. Malformed frames are likewise
    /// dropped and counted. Nothing here tears down the connection.
    pub async fn dispatch_inbound(&self, frame: &[u8]) {
        let message = match self.codec.decode_frame(frame) {
            Ok(message) => message,
            Err(error) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!(%error, "dropping undecodable inbound frame");
                return;
            }
        };

        let Some(id) = message.operation_id().cloned() else {
            // ConnectionAck / KeepAlive are connection-scoped; nothing to
            // route.
            return;
        };

        let observer = {
            let operations = self.operations.lock().await;
            operations
                .get(&id)
                .map(|registration| registration.observer.clone())
        };

        match observer {
            Some(observer) => {
                if let Err(error) = observer.push(message).await {
                    warn!(operation = %id, %error, "inbound delivery failed");
                }
            }
            None => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!(operation = %id, "dropping frame for unregistered operation");
            }
        }
    }

    /// Bulk teardown when the transport connection closes: no observer or
    /// broker subscription outlives its connection.
    pub async fn close(&self) {
        let drained: Vec<Registration> = {
            let mut operations = self.operations.lock().await;
            operations.drain().map(|(_, reg)| reg).collect()
        };
        for registration in drained {
            self.relay
                .unsubscribe(&registration.topic, &registration.observer)
                .await;
            registration.observer.dispose();
        }
    }

    /// Number of frames dropped for being malformed or unroutable.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Number of operations currently registered.
    pub async fn operation_count(&self) -> usize {
        self.operations.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use pulseql_protocol::{JsonCodec, OperationMessage};
    use std::time::Duration;

    fn router() -> ConnectionRouter {
        let codec: Arc<dyn MessageCodec> = Arc::new(JsonCodec::new());
        let relay = Arc::new(TopicRelay::new(
            Arc::new(InMemoryBroker::new(64)),
            Arc::clone(&codec),
        ));
        let config = SubscriptionConfig::new()
            .buffer_capacity(8)
            .stall_timeout(Duration::from_millis(100));
        ConnectionRouter::new(relay, codec, config)
    }

    #[tokio::test]
    async fn test_duplicate_operation_rejected() {
        let router = router();

        let first = router.subscribe("a".into(), "t").await.unwrap();
        let result = router.subscribe("a".into(), "t").await;

        assert!(matches!(
            result,
            Err(SubscriptionError::DuplicateOperation(ref id)) if id.as_str() == "a"
        ));
        // The existing observer is untouched.
        assert!(!first.is_terminal());
        assert_eq!(router.operation_count().await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id_is_silent() {
        let router = router();
        router.unsubscribe(&"ghost".into()).await;
        assert_eq!(router.operation_count().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_matching_observer() {
        let router = router();
        let observer = router.subscribe("a".into(), "t").await.unwrap();

        let frame = br#"{"type":"data","id":"a","payload":{"n":5}}"#;
        router.dispatch_inbound(frame).await;

        assert_eq!(
            observer.read_next().await.unwrap(),
            Some(OperationMessage::Data {
                id: "a".into(),
                payload: serde_json::json!({"n": 5}),
            })
        );
        assert_eq!(router.dropped_frames(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_frame_dropped_and_counted() {
        let router = router();
        let _observer = router.subscribe("a".into(), "t").await.unwrap();

        router
            .dispatch_inbound(br#"{"type":"data","id":"nobody","payload":1}"#)
            .await;

        assert_eq!(router.dropped_frames(), 1);
        assert_eq!(router.operation_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped_and_counted() {
        let router = router();
        router.dispatch_inbound(b"garbage").await;
        assert_eq!(router.dropped_frames(), 1);
    }

    #[tokio::test]
    async fn test_connection_scoped_frames_are_ignored() {
        let router = router();
        router.dispatch_inbound(br#"{"type":"ka"}"#).await;
        router.dispatch_inbound(br#"{"type":"connection_ack"}"#).await;
        assert_eq!(router.dropped_frames(), 0);
    }

    #[tokio::test]
    async fn test_inbound_complete_terminates_operation() {
        let router = router();
        let observer = router.subscribe("a".into(), "t").await.unwrap();

        router
            .dispatch_inbound(br#"{"type":"complete","id":"a"}"#)
            .await;

        assert_eq!(
            observer.read_next().await.unwrap(),
            Some(OperationMessage::Complete { id: "a".into() })
        );
        assert_eq!(observer.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_clears_operations_and_relay_subscriptions() {
        let codec: Arc<dyn MessageCodec> = Arc::new(JsonCodec::new());
        let relay = Arc::new(TopicRelay::new(
            Arc::new(InMemoryBroker::new(64)),
            Arc::clone(&codec),
        ));
        let router = ConnectionRouter::new(
            Arc::clone(&relay),
            codec,
            SubscriptionConfig::new().stall_timeout(Duration::from_millis(100)),
        );

        let a = router.subscribe("a".into(), "t1").await.unwrap();
        let b = router.subscribe("b".into(), "t2").await.unwrap();

        router.close().await;

        assert_eq!(router.operation_count().await, 0);
        assert!(a.is_disposed());
        assert!(b.is_disposed());
        assert!(!relay.is_subscribed("t1").await);
        assert!(!relay.is_subscribed("t2").await);
        assert_eq!(relay.topic_count().await, 0);
    }
}
