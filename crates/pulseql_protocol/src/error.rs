//! Error types for the protocol layer.

use thiserror::Error;

/// Errors produced while encoding or decoding wire messages.
///
/// Decode failures are recoverable by design: the routing layer drops the
/// offending frame and keeps the connection alive.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization of an event or frame failed.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// The bytes did not parse as a valid event or frame.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The frame parsed but violates a protocol rule, e.g. a data message
    /// with an empty operation id.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
