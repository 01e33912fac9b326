//! Method registry dispatching calls by method key.
//!
//! The registry maps method keys to typed handlers. A handler's parameter
//! tuple is decoded from the reader before its future starts, so the reader
//! is never held across an await point.
//!
//! # Example
//!
//! ```ignore
//! use wsrpc::{Connection, MethodRegistry};
//!
//! let mut registry = MethodRegistry::<MsgPackCodec>::new();
//!
//! registry.register(1, |connection: Connection, (text,): (String,)| async move {
//!     connection.call::<MsgPackCodec, _>(2, (text.to_uppercase(),)).await
//! })?;
//!
//! registry.on_connect(|connection| async move {
//!     tracing::info!(connection = connection.id(), "player joined");
//!     Ok(())
//! });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::warn;

use super::params::FromParameters;
use super::Dispatcher;
use crate::codec::{MsgPackCodec, ParameterCodec};
use crate::connection::Connection;
use crate::error::{ProtocolError, Result, RpcError};
use crate::protocol::{MessageReader, KEEP_ALIVE_METHOD_KEY};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Decode the call's parameters from `reader` and start the handler.
    fn call(
        &self,
        connection: Connection,
        reader: &mut MessageReader,
    ) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that decodes a parameter tuple before calling the handler.
pub struct TypedHandler<F, Args, Fut, C>
where
    F: Fn(Connection, Args) -> Fut + Send + Sync + 'static,
    Args: FromParameters,
    Fut: Future<Output = HandlerResult> + Send + 'static,
    C: ParameterCodec,
{
    handler: F,
    _phantom: PhantomData<fn(Args, C) -> Fut>,
}

impl<F, Args, Fut, C> TypedHandler<F, Args, Fut, C>
where
    F: Fn(Connection, Args) -> Fut + Send + Sync + 'static,
    Args: FromParameters,
    Fut: Future<Output = HandlerResult> + Send + 'static,
    C: ParameterCodec,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Args, Fut, C> Handler for TypedHandler<F, Args, Fut, C>
where
    F: Fn(Connection, Args) -> Fut + Send + Sync + 'static,
    Args: FromParameters,
    Fut: Future<Output = HandlerResult> + Send + 'static,
    C: ParameterCodec,
{
    fn call(
        &self,
        connection: Connection,
        reader: &mut MessageReader,
    ) -> BoxFuture<'static, HandlerResult> {
        let args = match Args::read_parameters::<C>(reader) {
            Ok(args) => args,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        Box::pin((self.handler)(connection, args))
    }
}

type Hook = Box<dyn Fn(Connection) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Registry mapping method keys to handlers, usable as a [`Dispatcher`].
pub struct MethodRegistry<C = MsgPackCodec> {
    handlers: HashMap<i32, Box<dyn Handler>>,
    on_connected: Option<Hook>,
    on_disconnected: Option<Hook>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: ParameterCodec> MethodRegistry<C> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            on_connected: None,
            on_disconnected: None,
            _codec: PhantomData,
        }
    }

    /// Register a handler for `method_key`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Registration`] for the reserved key `0` or a key
    /// that already has a handler.
    pub fn register<F, Args, Fut>(&mut self, method_key: i32, handler: F) -> Result<()>
    where
        F: Fn(Connection, Args) -> Fut + Send + Sync + 'static,
        Args: FromParameters,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if method_key == KEEP_ALIVE_METHOD_KEY {
            return Err(RpcError::Registration(format!(
                "method key {KEEP_ALIVE_METHOD_KEY} is reserved for keep-alive"
            )));
        }
        if self.handlers.contains_key(&method_key) {
            return Err(RpcError::Registration(format!(
                "method key {method_key} is already registered"
            )));
        }
        let typed = TypedHandler::<F, Args, Fut, C>::new(handler);
        self.handlers.insert(method_key, Box::new(typed));
        Ok(())
    }

    /// Run `hook` when a connection starts processing.
    ///
    /// A failing hook terminates the connection before the handshake frame.
    pub fn on_connect<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_connected = Some(Box::new(move |c| Box::pin(hook(c))));
    }

    /// Run `hook` after a connection stopped processing.
    pub fn on_disconnect<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_disconnected = Some(Box::new(move |c| Box::pin(hook(c))));
    }

    /// Get a handler by method key.
    pub fn get_handler(&self, method_key: i32) -> Option<&dyn Handler> {
        self.handlers.get(&method_key).map(|h| h.as_ref())
    }

    /// Whether `method_key` has a handler.
    pub fn contains(&self, method_key: i32) -> bool {
        self.handlers.contains_key(&method_key)
    }

    /// Registered method keys, in no particular order.
    pub fn method_keys(&self) -> impl Iterator<Item = i32> + '_ {
        self.handlers.keys().copied()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: ParameterCodec> Default for MethodRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for MethodRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("MethodRegistry")
            .field("method_keys", &keys)
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .finish()
    }
}

#[async_trait]
impl<C: ParameterCodec> Dispatcher for MethodRegistry<C> {
    async fn on_connected(&self, connection: &Connection) -> Result<()> {
        match &self.on_connected {
            Some(hook) => hook(connection.clone()).await,
            None => Ok(()),
        }
    }

    async fn on_disconnected(&self, connection: &Connection) {
        if let Some(hook) = &self.on_disconnected {
            if let Err(e) = hook(connection.clone()).await {
                warn!(connection = connection.id(), error = %e, "disconnect hook failed");
            }
        }
    }

    async fn dispatch(
        &self,
        connection: &Connection,
        method_key: i32,
        reader: &mut MessageReader,
    ) -> Result<()> {
        let handler = self
            .get_handler(method_key)
            .ok_or(ProtocolError::UnknownMethodKey(method_key))?;

        handler.call(connection.clone(), reader).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BufferOptions, MessageWriter};
    use crate::transport::pair;
    use std::sync::{Arc, Mutex};

    fn connection() -> Connection {
        let (local, _remote) = pair();
        Connection::new(Arc::new(local))
    }

    fn reader_for(key: i32, write: impl FnOnce(&mut MessageWriter)) -> MessageReader {
        let mut writer = MessageWriter::new(BufferOptions::new(64, 1024));
        writer.write_method_key(key).unwrap();
        write(&mut writer);
        let mut reader = MessageReader::new(BufferOptions::new(64, 1024));
        reader.push(writer.written()).unwrap();
        reader
    }

    #[test]
    fn test_register_method() {
        let mut registry = MethodRegistry::<MsgPackCodec>::new();
        registry
            .register(1, |_c: Connection, (_text,): (String,)| async { Ok(()) })
            .unwrap();

        assert!(registry.contains(1));
        assert!(registry.get_handler(1).is_some());
        assert!(registry.get_handler(2).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reserved_key_is_rejected() {
        let mut registry = MethodRegistry::<MsgPackCodec>::new();
        let err = registry
            .register(0, |_c: Connection, (): ()| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, RpcError::Registration(_)));
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut registry = MethodRegistry::<MsgPackCodec>::new();
        registry
            .register(4, |_c: Connection, (): ()| async { Ok(()) })
            .unwrap();
        let err = registry
            .register(4, |_c: Connection, (_n,): (u8,)| async { Ok(()) })
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_dispatch_decodes_parameters() {
        let seen = Arc::new(Mutex::new(None));
        let mut registry = MethodRegistry::<MsgPackCodec>::new();
        {
            let seen = seen.clone();
            registry
                .register(3, move |_c: Connection, (name, n): (String, u32)| {
                    let seen = seen.clone();
                    async move {
                        *seen.lock().unwrap() = Some((name, n));
                        Ok(())
                    }
                })
                .unwrap();
        }

        let mut reader = reader_for(3, |w| {
            w.encode_parameter::<MsgPackCodec, _>("bob").unwrap();
            w.encode_parameter::<MsgPackCodec, _>(&9u32).unwrap();
        });
        let key = reader.read_method_key().unwrap();
        registry.dispatch(&connection(), key, &mut reader).await.unwrap();

        assert!(reader.end_of_message());
        assert_eq!(*seen.lock().unwrap(), Some(("bob".to_string(), 9)));
    }

    #[tokio::test]
    async fn test_unknown_method_key() {
        let registry = MethodRegistry::<MsgPackCodec>::new();
        let mut reader = reader_for(3, |_| {});
        let key = reader.read_method_key().unwrap();
        let err = registry
            .dispatch(&connection(), key, &mut reader)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::UnknownMethodKey(3))
        ));
    }

    #[tokio::test]
    async fn test_hooks_run() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = MethodRegistry::<MsgPackCodec>::new();
        {
            let events = events.clone();
            registry.on_connect(move |_c| {
                let events = events.clone();
                async move {
                    events.lock().unwrap().push("connected");
                    Ok(())
                }
            });
        }
        {
            let events = events.clone();
            registry.on_disconnect(move |_c| {
                let events = events.clone();
                async move {
                    events.lock().unwrap().push("disconnected");
                    Ok(())
                }
            });
        }

        let connection = connection();
        Dispatcher::on_connected(&registry, &connection).await.unwrap();
        Dispatcher::on_disconnected(&registry, &connection).await;
        assert_eq!(*events.lock().unwrap(), vec!["connected", "disconnected"]);
    }
}
