//! Operation messages: the tagged union every subscription frame decodes to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The identifier of one client-issued subscription operation.
///
/// Chosen by the client and unique only within its connection; the router
/// uses it as the demultiplexing key. Opaque to the server beyond equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Creates an operation id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is the empty string, which no valid
    /// data/error/complete message may carry.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One protocol frame, after decoding.
///
/// `Data`, `Error` and `Complete` are operation-scoped and carry the id of
/// the operation they belong to; `Error` and `Complete` are terminal for
/// that operation. `ConnectionAck` and `KeepAlive` are connection-scoped
/// and never enter an operation's buffer.
///
/// Internally tagged (`"type"`) so the JSON matches the
/// graphql-over-websocket wire names: `data`, `error`, `complete`,
/// `connection_ack`, `ka`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationMessage {
    /// One emitted event/result for an operation.
    Data {
        id: OperationId,
        payload: serde_json::Value,
    },

    /// Terminal failure of an operation, carrying the GraphQL errors.
    Error {
        id: OperationId,
        errors: Vec<serde_json::Value>,
    },

    /// Terminal completion of an operation, no error.
    Complete { id: OperationId },

    /// Server acknowledgment of connection initialization.
    ConnectionAck,

    /// Connection-level keep-alive ping.
    #[serde(rename = "ka")]
    KeepAlive,
}

impl OperationMessage {
    /// Returns the operation id for operation-scoped messages, `None` for
    /// connection-scoped ones.
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            Self::Data { id, .. } | Self::Error { id, .. } | Self::Complete { id } => Some(id),
            Self::ConnectionAck | Self::KeepAlive => None,
        }
    }

    /// Returns true if this message ends its operation's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }
}
