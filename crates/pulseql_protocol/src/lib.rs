//! Wire protocol for PulseQL subscriptions.
//!
//! This crate defines the operation messages that travel between a client
//! connection and the server, plus the codec that carries subscription
//! events across the distributed broker boundary. Everything else in the
//! subscription layer depends on these types.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{Decoded, JsonCodec, MessageCodec, COMPLETION_SENTINEL};
pub use error::ProtocolError;
pub use message::{OperationId, OperationMessage};
