//! Error types for wsrpc.

use thiserror::Error;

use crate::transport::MessageType;

/// Violations of the wire protocol. All of them are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The transport delivered a frame that is not binary.
    #[error("Invalid message type: {0:?}")]
    InvalidMessageType(MessageType),

    /// Fewer bytes remain in the message than the next field needs.
    #[error("Truncated message: needed {needed} bytes to read the {field}, {remaining} remaining")]
    TruncatedMessage {
        /// Which field was being read.
        field: &'static str,
        /// Bytes required for the field.
        needed: usize,
        /// Bytes left in the message.
        remaining: usize,
    },

    /// A parameter length prefix is negative or larger than the rest of the message.
    #[error("Invalid parameter length {length} ({remaining} bytes remaining)")]
    InvalidParameterLength {
        /// Length prefix as sent by the peer.
        length: i32,
        /// Bytes left in the message after the prefix.
        remaining: usize,
    },

    /// A keep-alive arrived although no inactivity timeout is configured.
    #[error("Unexpected keep-alive, the connection is not configured to time out")]
    UnexpectedKeepAlive,

    /// No handler is registered for the method key.
    #[error("Method with key {0} does not exist")]
    UnknownMethodKey(i32),
}

/// Main error type for all wsrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error reported by tungstenite.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The transport is closed (or was aborted) and cannot be used anymore.
    #[error("Transport closed")]
    TransportClosed,

    /// The peer violated the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A buffer would have to grow beyond its configured maximum.
    #[error("Buffer of {requested} bytes exceeds maximum size of {maximum} bytes")]
    BufferOverflow {
        /// Size the buffer would need.
        requested: usize,
        /// Configured maximum.
        maximum: usize,
    },

    /// The operation was cancelled (shutdown, inactivity timeout or disconnect).
    #[error("Operation cancelled")]
    Cancelled,

    /// Waiting for an event took longer than allowed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// A handler or method key could not be registered.
    #[error("Registration error: {0}")]
    Registration(String),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Whether this error is a wire protocol violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self, RpcError::Protocol(_))
    }

    /// Whether this error stems from cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcError::Cancelled)
    }

    /// Whether the error terminates the connection it occurred on.
    ///
    /// Everything except cancellation and test-side timeouts counts as fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RpcError::Cancelled | RpcError::Timeout(_))
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
