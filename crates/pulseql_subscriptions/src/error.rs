//! Error types for the subscription layer.
//!
//! Every variant is scoped to one operation, one topic, or one broker
//! call; nothing here is fatal to the hosting process.

use pulseql_protocol::OperationId;
use thiserror::Error;

/// Errors surfaced by observers, routers and the topic relay.
///
/// `Clone` because a terminal error is stored once in an observer's error
/// slot and handed to whichever reader drains it.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// A second `subscribe` with an id that is still registered on the
    /// same connection. The existing operation is left untouched.
    #[error("operation `{0}` is already registered on this connection")]
    DuplicateOperation(OperationId),

    /// The observer was disposed; no further push or read is possible.
    #[error("operation observer is disposed")]
    ObserverDisposed,

    /// The consumer did not drain its buffer within the stall timeout.
    /// Terminal for the operation it occurred on.
    #[error("consumer stalled: buffer not drained within the stall timeout")]
    ConsumerStalled,

    /// The broker rejected or could not accept a publish. The event
    /// producer decides whether to retry; the relay never does.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The broker-level subscription for a topic failed or degraded.
    /// Delivered as a terminal error to every local observer on that
    /// topic.
    #[error("broker subscription failed: {0}")]
    Broker(String),
}
