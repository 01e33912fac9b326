//! Transport module - message-oriented full-duplex sockets.
//!
//! The RPC runtime only needs a small slice of a WebSocket: receive into a
//! caller-provided buffer (possibly in several partial reads), send whole
//! frames, run the close handshake and abort. [`Transport`] captures that
//! slice so the same processing loop runs over:
//!
//! - [`WebSocketTransport`] - `tokio-tungstenite` sockets
//! - [`MemoryTransport`] - in-process channel pairs used by tests
//!
//! All methods take `&self`: one task receives while others send, and the
//! cancellation watchdog may close the output at any time.

pub mod memory;
pub mod websocket;

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result, RpcError};
use crate::protocol::MessageReader;

pub use memory::{pair, MemoryTransport};
pub use websocket::{accept, connect, WebSocketTransport};

/// Kind of a received or sent frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Binary frame. The only kind carrying RPC calls.
    Binary,
    /// UTF-8 text frame.
    Text,
    /// Close frame from the peer.
    Close,
}

/// Outcome of a single [`Transport::receive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveResult {
    /// Bytes written into the receive buffer.
    pub count: usize,
    /// Kind of the frame these bytes belong to.
    pub message_type: MessageType,
    /// Whether this receive completed the frame.
    pub end_of_message: bool,
}

impl ReceiveResult {
    /// Result signalling a close frame from the peer.
    pub fn close() -> Self {
        Self {
            count: 0,
            message_type: MessageType::Close,
            end_of_message: true,
        }
    }
}

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Both directions are usable.
    Open,
    /// We sent a close frame and are waiting for the peer's.
    CloseSent,
    /// The peer sent a close frame which we have not acknowledged yet.
    CloseReceived,
    /// The close handshake completed.
    Closed,
    /// The socket was torn down without a handshake.
    Aborted,
}

/// A message-oriented, full-duplex socket.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Receive the next chunk of the current frame into `buf`.
    ///
    /// A frame larger than `buf` is delivered across several calls; the last
    /// one has `end_of_message` set. A close frame from the peer is reported
    /// as [`MessageType::Close`] with a count of zero.
    async fn receive(&self, buf: &mut [u8]) -> Result<ReceiveResult>;

    /// Send `data` as one complete frame.
    async fn send(&self, data: &[u8], message_type: MessageType) -> Result<()>;

    /// Send a close frame (or acknowledge the peer's) with a normal closure status.
    ///
    /// Does nothing if our close frame was already sent.
    async fn close_output(&self) -> Result<()>;

    /// Tear the socket down immediately. Pending and future operations fail.
    fn abort(&self);
}

/// How a receive into a [`MessageReader`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    /// A complete binary frame is buffered in the reader.
    Message,
    /// The peer sent a close frame.
    Close,
}

/// Receive one complete frame into `reader`.
///
/// Fires of `cancel` abort the transport and surface as [`RpcError::Cancelled`].
/// Text frames are a protocol violation.
pub(crate) async fn receive_message(
    transport: &dyn Transport,
    reader: &mut MessageReader,
    cancel: &CancellationToken,
) -> Result<Received> {
    loop {
        let buf = reader.receive_buffer()?;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                transport.abort();
                return Err(RpcError::Cancelled);
            }
            result = transport.receive(buf) => result?,
        };

        match result.message_type {
            MessageType::Binary => {}
            MessageType::Close => return Ok(Received::Close),
            other => return Err(ProtocolError::InvalidMessageType(other).into()),
        }

        reader.advance(result.count);
        if result.end_of_message {
            return Ok(Received::Message);
        }
    }
}
