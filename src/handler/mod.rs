//! Handler module - call dispatch.
//!
//! Provides:
//! - [`Dispatcher`] - the seam between the processing loop and user code
//! - [`MethodRegistry`] - maps method keys to typed handlers
//! - [`FromParameters`] / [`ToParameters`] - parameter tuple conversion
//!
//! # Example
//!
//! ```ignore
//! use wsrpc::handler::MethodRegistry;
//!
//! let mut registry = MethodRegistry::<MsgPackCodec>::new();
//!
//! registry.register(CHAT, |connection, (room, text): (u32, String)| async move {
//!     tracing::debug!(connection = connection.id(), room, "chat message");
//!     connection.call::<MsgPackCodec, _>(ECHO, (text,)).await
//! })?;
//! ```

mod params;
mod registry;

use async_trait::async_trait;
use tracing::trace;

use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{MessageReader, KEEP_ALIVE_METHOD_KEY};

pub use params::{FromParameters, ToParameters};
pub use registry::{Handler, HandlerResult, MethodRegistry, TypedHandler};

/// Receives the calls of a connection.
///
/// Calls of one connection are dispatched strictly one after another; the
/// next call is not read before `dispatch` returns.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Called once before the handshake frame is sent.
    ///
    /// An error terminates the connection and is returned from processing.
    async fn on_connected(&self, _connection: &Connection) -> Result<()> {
        Ok(())
    }

    /// Called once after the processing loop exited, if
    /// [`on_connected`](Self::on_connected) succeeded.
    async fn on_disconnected(&self, _connection: &Connection) {}

    /// Handle one call. The method key has been consumed; the call's
    /// parameters are next in `reader`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownMethodKey`](crate::ProtocolError::UnknownMethodKey)
    /// for keys without a handler. Any error terminates the connection.
    async fn dispatch(
        &self,
        connection: &Connection,
        method_key: i32,
        reader: &mut MessageReader,
    ) -> Result<()>;
}

/// Dispatch every call of the frame buffered in `reader`, in order.
///
/// Keep-alive calls go to `on_keep_alive` instead of the dispatcher.
pub(crate) async fn dispatch_message<D>(
    dispatcher: &D,
    connection: &Connection,
    reader: &mut MessageReader,
    mut on_keep_alive: impl FnMut() -> Result<()> + Send,
) -> Result<()>
where
    D: Dispatcher + ?Sized,
{
    while !reader.end_of_message() {
        let method_key = reader.read_method_key()?;
        if method_key == KEEP_ALIVE_METHOD_KEY {
            on_keep_alive()?;
            continue;
        }

        trace!(connection = connection.id(), method_key, "dispatching call");
        dispatcher.dispatch(connection, method_key, reader).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProtocolError, RpcError};
    use crate::protocol::{BufferOptions, MessageWriter};
    use crate::transport::pair;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        keys: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch(
            &self,
            _connection: &Connection,
            method_key: i32,
            reader: &mut MessageReader,
        ) -> Result<()> {
            if method_key == 99 {
                return Err(ProtocolError::UnknownMethodKey(method_key).into());
            }
            reader.read_parameter()?;
            self.keys.lock().unwrap().push(method_key);
            Ok(())
        }
    }

    fn frame(calls: &[i32]) -> MessageReader {
        let mut writer = MessageWriter::new(BufferOptions::new(16, 1024));
        for &key in calls {
            writer.write_method_key(key).unwrap();
            if key != KEEP_ALIVE_METHOD_KEY {
                writer.write_parameter(&[key as u8]).unwrap();
            }
        }
        let mut reader = MessageReader::new(BufferOptions::new(16, 1024));
        reader.push(writer.written()).unwrap();
        reader
    }

    fn connection() -> Connection {
        let (local, _remote) = pair();
        Connection::new(Arc::new(local))
    }

    #[tokio::test]
    async fn test_dispatches_in_order() {
        let recorder = Recorder::default();
        let mut reader = frame(&[3, 1, 2]);
        dispatch_message(&recorder, &connection(), &mut reader, || Ok(()))
            .await
            .unwrap();
        assert_eq!(*recorder.keys.lock().unwrap(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_keep_alive_is_not_dispatched() {
        let recorder = Recorder::default();
        let mut keep_alives = 0;
        let mut reader = frame(&[0, 5, 0]);
        dispatch_message(&recorder, &connection(), &mut reader, || {
            keep_alives += 1;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(keep_alives, 2);
        assert_eq!(*recorder.keys.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_stops_at_first_error() {
        let recorder = Recorder::default();
        let mut reader = frame(&[1, 99, 2]);
        let err = dispatch_message(&recorder, &connection(), &mut reader, || Ok(()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::UnknownMethodKey(99))
        ));
        assert_eq!(*recorder.keys.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_keep_alive_error_propagates() {
        let recorder = Recorder::default();
        let mut reader = frame(&[0]);
        let err = dispatch_message(&recorder, &connection(), &mut reader, || {
            Err(ProtocolError::UnexpectedKeepAlive.into())
        })
        .await
        .unwrap_err();
        assert!(err.is_protocol());
    }
}
