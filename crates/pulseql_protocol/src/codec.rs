//! Codec for the broker and transport serialization boundaries.
//!
//! Two kinds of bytes cross this layer: event payloads published to the
//! distributed broker, and whole protocol frames exchanged with clients.
//! Both go through an explicitly constructed codec instance that is passed
//! to every component needing one; there is no process-wide serializer
//! state.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::message::OperationMessage;

/// The reserved byte sequence that signals "this topic is finished" on the
/// broker. It is compared byte-for-byte before any JSON parsing, so it can
/// never collide with an encoded event payload (events are encoded from
/// caller values, and an event that happened to serialize to these exact
/// bytes would be a `{"isCompletedMessage":true}` object, which the
/// publish path never produces for data).
pub const COMPLETION_SENTINEL: &[u8] = b"{\"isCompletedMessage\":true}";

/// The result of decoding bytes received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A regular event payload.
    Event(serde_json::Value),
    /// The completion sentinel: no more events on this topic.
    Completed,
}

/// Serializes events and frames to bytes and back.
///
/// `Send + Sync + 'static` because the relay shares one codec across all
/// topic receive loops.
pub trait MessageCodec: Send + Sync + 'static {
    /// Encodes an event payload for broker publication.
    fn encode(&self, event: &serde_json::Value) -> Result<Bytes, ProtocolError>;

    /// Decodes broker bytes into an event or the completion sentinel.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` for malformed bytes; callers treat
    /// that as drop-and-log, never as fatal.
    fn decode(&self, data: &[u8]) -> Result<Decoded, ProtocolError>;

    /// Returns the completion sentinel bytes.
    fn encode_completion(&self) -> Bytes;

    /// Encodes a whole protocol frame for the client transport.
    fn encode_frame(&self, message: &OperationMessage) -> Result<Bytes, ProtocolError>;

    /// Decodes a client transport frame.
    fn decode_frame(&self, data: &[u8]) -> Result<OperationMessage, ProtocolError>;
}

/// JSON codec, the default wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Creates a new JSON codec.
    pub fn new() -> Self {
        Self
    }
}

impl MessageCodec for JsonCodec {
    fn encode(&self, event: &serde_json::Value) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(event)
            .map(Bytes::from)
            .map_err(ProtocolError::Encode)
    }

    fn decode(&self, data: &[u8]) -> Result<Decoded, ProtocolError> {
        if data == COMPLETION_SENTINEL {
            return Ok(Decoded::Completed);
        }
        serde_json::from_slice(data)
            .map(Decoded::Event)
            .map_err(ProtocolError::Decode)
    }

    fn encode_completion(&self) -> Bytes {
        Bytes::from_static(COMPLETION_SENTINEL)
    }

    fn encode_frame(&self, message: &OperationMessage) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(ProtocolError::Encode)
    }

    fn decode_frame(&self, data: &[u8]) -> Result<OperationMessage, ProtocolError> {
        let message: OperationMessage =
            serde_json::from_slice(data).map_err(ProtocolError::Decode)?;
        if let Some(id) = message.operation_id() {
            if id.is_empty() {
                return Err(ProtocolError::InvalidMessage(
                    "operation-scoped frame with empty id".to_string(),
                ));
            }
        }
        Ok(message)
    }
}
