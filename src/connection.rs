//! Connections: one peer attached to one transport.
//!
//! A [`Connection`] is a cheap, cloneable handle. Handlers receive it to call
//! back into the peer; the processing loop owns its lifecycle. Every
//! connection carries a cancellation token that fires when it disconnects,
//! which stops all sends still in flight.
//!
//! # Example
//!
//! ```ignore
//! // Inside a handler: call method 3 on the peer with two parameters
//! connection.call::<MsgPackCodec, _>(3, (&name, 42u32)).await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::ParameterCodec;
use crate::error::{Result, RpcError};
use crate::handler::ToParameters;
use crate::protocol::{
    BufferOptions, MessageWriter, DEFAULT_MAX_WRITER_SIZE, DEFAULT_WRITER_BUFFER_SIZE,
};
use crate::transport::{MessageType, Transport};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection's processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, the loop has not started yet.
    Connecting,
    /// The connect hook ran; the handshake frame is being sent.
    Connected,
    /// Waiting for the next frame.
    Receiving,
    /// Handing calls of a frame to the dispatcher.
    Dispatching,
    /// The loop exited and cleanup is running.
    Disconnecting,
    /// Cleanup finished. Terminal.
    Disconnected,
}

struct ConnectionInner {
    id: u64,
    transport: Arc<dyn Transport>,
    disconnected: CancellationToken,
    state: Mutex<ConnectionState>,
    writer_options: BufferOptions,
}

/// Handle to one peer.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Attach a connection to `transport` with default writer buffers.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_writer_options(
            transport,
            BufferOptions::new(DEFAULT_WRITER_BUFFER_SIZE, DEFAULT_MAX_WRITER_SIZE),
        )
    }

    /// Attach a connection whose writers use `writer_options`.
    pub fn with_writer_options(transport: Arc<dyn Transport>, writer_options: BufferOptions) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                transport,
                disconnected: CancellationToken::new(),
                state: Mutex::new(ConnectionState::Connecting),
                writer_options,
            }),
        }
    }

    /// Process-unique id, used in log events.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The underlying transport.
    #[inline]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Token fired when the connection disconnects.
    pub fn disconnected(&self) -> CancellationToken {
        self.inner.disconnected.clone()
    }

    /// Whether the connection has disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.is_cancelled()
    }

    /// Fire the disconnect token. Pending sends fail with [`RpcError::Cancelled`].
    pub(crate) fn cancel(&self) {
        self.inner.disconnected.cancel();
    }

    /// A fresh writer using this connection's buffer options.
    pub fn writer(&self) -> MessageWriter {
        MessageWriter::new(self.inner.writer_options.clone())
    }

    /// Send everything written into `writer` as one binary frame.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Cancelled`] if the connection disconnects first,
    /// or the transport's error.
    pub async fn send(&self, writer: &MessageWriter) -> Result<()> {
        self.send_raw(writer.written()).await
    }

    /// Send pre-encoded bytes as one binary frame.
    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let disconnected = &self.inner.disconnected;
        if disconnected.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = disconnected.cancelled() => Err(RpcError::Cancelled),
            result = self.inner.transport.send(data, MessageType::Binary) => result,
        }
    }

    /// Like [`send`](Self::send), but swallows failures.
    ///
    /// Returns whether the frame was handed to the transport.
    pub async fn try_send(&self, writer: &MessageWriter) -> bool {
        match self.send(writer).await {
            Ok(()) => true,
            Err(e) => {
                debug!(connection = self.id(), error = %e, "send failed");
                false
            }
        }
    }

    /// Encode one call with codec `C` and send it.
    pub async fn call<C, P>(&self, method_key: i32, parameters: P) -> Result<()>
    where
        C: ParameterCodec,
        P: ToParameters,
    {
        let mut writer = self.writer();
        writer.write_method_key(method_key)?;
        parameters.write_parameters::<C>(&mut writer)?;
        self.send(&writer).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("transport", &self.inner.transport)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}
