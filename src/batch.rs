//! Multi-call batches and broadcast.
//!
//! A [`Batch`] accumulates calls into a single writer. The encoded bytes
//! can then be sent to one peer, or the same bytes flushed to many peers
//! with [`Batch::broadcast`].
//!
//! # Example
//!
//! ```ignore
//! use wsrpc::Batch;
//!
//! let mut batch = Batch::<MsgPackCodec>::new();
//! batch.call(PLAYER_MOVED, (player_id, x, y))?;
//! batch.call(SCORE_CHANGED, (score,))?;
//! let report = batch.broadcast(&connections).await;
//! tracing::debug!(delivered = report.delivered, failed = report.failed, "tick sent");
//! ```

use std::marker::PhantomData;

use futures_util::future::join_all;

use crate::codec::{MsgPackCodec, ParameterCodec};
use crate::connection::Connection;
use crate::error::Result;
use crate::handler::ToParameters;
use crate::protocol::{
    BufferOptions, MessageWriter, DEFAULT_MAX_WRITER_SIZE, DEFAULT_WRITER_BUFFER_SIZE,
};

/// Outcome of a [`Batch::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the frame was handed to.
    pub delivered: usize,
    /// Recipients whose send failed.
    pub failed: usize,
}

/// Calls accumulated into one frame.
#[derive(Debug)]
pub struct Batch<C = MsgPackCodec> {
    writer: MessageWriter,
    calls: usize,
    _codec: PhantomData<fn() -> C>,
}

impl<C: ParameterCodec> Batch<C> {
    /// Create an empty batch with default writer buffers.
    pub fn new() -> Self {
        Self::with_options(BufferOptions::new(
            DEFAULT_WRITER_BUFFER_SIZE,
            DEFAULT_MAX_WRITER_SIZE,
        ))
    }

    /// Create an empty batch with explicit writer buffer options.
    pub fn with_options(options: BufferOptions) -> Self {
        Self {
            writer: MessageWriter::new(options),
            calls: 0,
            _codec: PhantomData,
        }
    }

    /// Append a call with parameters encoded by `C`.
    ///
    /// On failure the batch is left exactly as it was before the call.
    pub fn call<P: ToParameters>(&mut self, method_key: i32, parameters: P) -> Result<&mut Self> {
        let mark = self.writer.len();
        let result = self
            .writer
            .write_method_key(method_key)
            .and_then(|()| parameters.write_parameters::<C>(&mut self.writer));
        if let Err(e) = result {
            self.writer.truncate(mark);
            return Err(e);
        }
        self.calls += 1;
        Ok(self)
    }

    /// Append a call whose parameters are already encoded.
    pub fn call_raw(&mut self, method_key: i32, parameters: &[&[u8]]) -> Result<&mut Self> {
        let mark = self.writer.len();
        let result = self.writer.write_method_key(method_key).and_then(|()| {
            parameters
                .iter()
                .try_for_each(|parameter| self.writer.write_parameter(parameter))
        });
        if let Err(e) = result {
            self.writer.truncate(mark);
            return Err(e);
        }
        self.calls += 1;
        Ok(self)
    }

    /// Send the batch to one peer.
    pub async fn send(&self, connection: &Connection) -> Result<()> {
        connection.send(&self.writer).await
    }

    /// Send the batch to one peer, swallowing failures.
    pub async fn try_send(&self, connection: &Connection) -> bool {
        connection.try_send(&self.writer).await
    }

    /// Send the same bytes to every recipient concurrently.
    ///
    /// A failing recipient does not affect the others.
    pub async fn broadcast<'a, I>(&self, recipients: I) -> BroadcastReport
    where
        I: IntoIterator<Item = &'a Connection>,
    {
        let results = join_all(recipients.into_iter().map(|c| self.try_send(c))).await;
        let delivered = results.iter().filter(|&&ok| ok).count();
        BroadcastReport {
            delivered,
            failed: results.len() - delivered,
        }
    }

    /// Number of calls in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.calls
    }

    /// Whether the batch holds no calls.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.calls == 0
    }

    /// The encoded frame.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.writer.written()
    }

    /// Drop all calls and release the buffer.
    pub fn clear(&mut self) {
        self.writer.reset();
        self.calls = 0;
    }
}

impl<C: ParameterCodec> Default for Batch<C> {
    fn default() -> Self {
        Self::new()
    }
}
