//! Composition root for the subscription layer.
//!
//! A [`SubscriptionSession`] holds the process-wide relay and stamps out
//! one [`ConnectionRouter`] per transport connection. It also derives the
//! broker topic for a subscription from its resolved arguments, so that
//! semantically identical subscriptions share a topic across connections
//! and processes.

use std::sync::Arc;

use pulseql_protocol::{JsonCodec, MessageCodec};

use crate::broker::{InMemoryBroker, TopicBroker};
use crate::config::SubscriptionConfig;
use crate::relay::TopicRelay;
use crate::router::ConnectionRouter;

/// Derives the broker topic for a subscription field and its resolved
/// arguments.
///
/// Canonical: object keys are emitted in sorted order at every nesting
/// level, so argument maps built in different orders produce the same
/// topic name.
pub fn topic_for(field: &str, arguments: &serde_json::Value) -> String {
    let mut topic = String::from(field);
    if !arguments.is_null() {
        topic.push(':');
        write_canonical(arguments, &mut topic);
    }
    topic
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Binds connection routers to one shared topic relay.
pub struct SubscriptionSession {
    relay: Arc<TopicRelay>,
    codec: Arc<dyn MessageCodec>,
    config: SubscriptionConfig,
}

impl SubscriptionSession {
    /// Creates a session over an externally provided broker and codec.
    pub fn new(
        broker: Arc<dyn TopicBroker>,
        codec: Arc<dyn MessageCodec>,
        config: SubscriptionConfig,
    ) -> Self {
        let relay = Arc::new(TopicRelay::new(broker, Arc::clone(&codec)));
        Self {
            relay,
            codec,
            config,
        }
    }

    /// Creates a session backed by the process-local broker and the JSON
    /// codec; the single-process deployment and the test default.
    pub fn in_memory(config: SubscriptionConfig) -> Self {
        let broker = Arc::new(InMemoryBroker::new(config.broker_capacity));
        Self::new(broker, Arc::new(JsonCodec::new()), config)
    }

    /// Creates the router for a newly accepted transport connection.
    pub fn connect(&self) -> ConnectionRouter {
        ConnectionRouter::new(
            Arc::clone(&self.relay),
            Arc::clone(&self.codec),
            self.config.clone(),
        )
    }

    /// The shared relay, for event producers (`publish` /
    /// `publish_completion`).
    pub fn relay(&self) -> Arc<TopicRelay> {
        Arc::clone(&self.relay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_for_without_arguments() {
        assert_eq!(topic_for("onOrder", &serde_json::Value::Null), "onOrder");
    }

    #[test]
    fn test_topic_for_sorts_keys_at_every_level() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});

        assert_eq!(topic_for("f", &a), topic_for("f", &b));
        assert_eq!(topic_for("f", &a), r#"f:{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn test_topic_for_distinguishes_different_arguments() {
        let a = serde_json::json!({"orderId": 42});
        let b = serde_json::json!({"orderId": 43});
        assert_ne!(topic_for("onOrder", &a), topic_for("onOrder", &b));
    }

    #[tokio::test]
    async fn test_session_routers_share_one_relay() {
        let session = SubscriptionSession::in_memory(SubscriptionConfig::new());
        let first = session.connect();
        let second = session.connect();

        first.subscribe("a".into(), "t").await.unwrap();
        second.subscribe("a".into(), "t").await.unwrap();

        // Same topic, one broker-level subscription, two local observers.
        assert_eq!(session.relay().local_subscriber_count("t").await, 2);
        assert_eq!(session.relay().topic_count().await, 1);
    }
}
