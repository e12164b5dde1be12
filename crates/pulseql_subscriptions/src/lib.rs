//! Subscription distribution for PulseQL.
//!
//! This crate is the live-query core of the framework: it multiplexes many
//! concurrent subscription operations over one client connection and fans
//! published events out across server processes through a pub/sub broker.
//!
//! The moving parts, leaves first:
//!
//! - [`OperationObserver`]: per-operation bounded consumer with
//!   backpressure and exactly-one terminal signal.
//! - [`ConnectionRouter`]: owns one connection's operation table,
//!   demultiplexes inbound frames to observers.
//! - [`TopicRelay`]: bridges local observers to the distributed broker,
//!   sharing one broker subscription per topic.
//! - [`SubscriptionSession`]: composition root wiring routers to the
//!   relay.
//!
//! GraphQL execution and transport framing live elsewhere; they meet this
//! crate only through event payloads ([`serde_json::Value`]) and raw
//! frames.

pub mod broker;
pub mod config;
pub mod error;
pub mod observer;
pub mod relay;
pub mod router;
pub mod session;

pub use broker::{BrokerError, BrokerSubscription, InMemoryBroker, TopicBroker};
pub use config::SubscriptionConfig;
pub use error::SubscriptionError;
pub use observer::OperationObserver;
pub use relay::TopicRelay;
pub use router::ConnectionRouter;
pub use session::{topic_for, SubscriptionSession};
