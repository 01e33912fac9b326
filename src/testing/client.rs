//! Test client recording every call the server makes.
//!
//! # Example
//!
//! ```ignore
//! let (client_side, server_side) = transport::pair();
//! let (_connection, task) = server.spawn(Arc::new(server_side), shutdown.clone());
//!
//! let client = TestClient::<MsgPackCodec>::builder()
//!     .method(CHAT_MESSAGE, 2)
//!     .connect(Arc::new(client_side))
//!     .await?;
//!
//! client.call(SEND_CHAT, ("hello",)).await?;
//! let call = client.received(CHAT_MESSAGE, |_| true).await?;
//! assert_eq!(call.decode::<MsgPackCodec, String>(1)?, "hello");
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::registry::{CallRegistry, RecordedCall};
use crate::client::{ClientBuilder, RpcClient};
use crate::codec::{MsgPackCodec, ParameterCodec};
use crate::connection::Connection;
use crate::error::{ProtocolError, Result, RpcError};
use crate::handler::{Dispatcher, FromParameters, ToParameters};
use crate::protocol::{BufferPool, MessageReader, KEEP_ALIVE_METHOD_KEY};
use crate::time::Clock;
use crate::transport::Transport;

type CallLog = Arc<Mutex<Vec<RecordedCall>>>;

/// Builder for a [`TestClient`].
#[derive(Debug)]
pub struct TestClientBuilder<C = MsgPackCodec> {
    client: ClientBuilder,
    methods: HashMap<i32, usize>,
    error: Option<RpcError>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: ParameterCodec> TestClientBuilder<C> {
    fn new() -> Self {
        Self {
            client: ClientBuilder::new(),
            methods: HashMap::new(),
            error: None,
            _codec: PhantomData,
        }
    }

    /// Record calls to `method_key`, each carrying `parameter_count` parameters.
    ///
    /// The reserved key `0` and duplicate keys fail [`connect`](Self::connect).
    pub fn method(mut self, method_key: i32, parameter_count: usize) -> Self {
        if self.error.is_some() {
            return self;
        }
        if method_key == KEEP_ALIVE_METHOD_KEY {
            self.error = Some(RpcError::Registration(format!(
                "method key {KEEP_ALIVE_METHOD_KEY} is reserved for keep-alive"
            )));
        } else if self.methods.insert(method_key, parameter_count).is_some() {
            self.error = Some(RpcError::Registration(format!(
                "method key {method_key} is already registered"
            )));
        }
        self
    }

    /// Record calls to `method_key` whose parameters decode as `P`.
    pub fn method_for<P: FromParameters>(self, method_key: i32) -> Self {
        self.method(method_key, P::COUNT)
    }

    /// How long [`TestClient::received`] and the handshake may take.
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.receive_timeout(timeout);
        self
    }

    /// Send a keep-alive every `interval`.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.client = self.client.ping_interval(interval);
        self
    }

    /// Drive pings from `clock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.client = self.client.clock(clock);
        self
    }

    /// Rent all buffers from `pool`.
    pub fn buffer_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.client = self.client.buffer_pool(pool);
        self
    }

    /// Start the client on `transport` and wait for the server's handshake.
    pub async fn connect(self, transport: Arc<dyn Transport>) -> Result<TestClient<C>> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let log = CallLog::default();
        let registries: HashMap<_, _> = self
            .methods
            .keys()
            .map(|&key| (key, Arc::new(CallRegistry::new(key))))
            .collect();
        let recorder = Recorder {
            methods: self
                .methods
                .iter()
                .map(|(&key, &count)| (key, (count, registries[&key].clone())))
                .collect(),
            log: log.clone(),
        };

        let receive_timeout = self.client.config().receive_timeout;
        let client = self.client.start(transport, recorder);
        client.wait_connected().await?;

        Ok(TestClient {
            client,
            registries,
            log,
            receive_timeout,
            _codec: PhantomData,
        })
    }
}

/// Dispatcher storing calls as raw parameters.
struct Recorder {
    methods: HashMap<i32, (usize, Arc<CallRegistry>)>,
    log: CallLog,
}

#[async_trait]
impl Dispatcher for Recorder {
    async fn dispatch(
        &self,
        connection: &Connection,
        method_key: i32,
        reader: &mut MessageReader,
    ) -> Result<()> {
        let (count, registry) = self
            .methods
            .get(&method_key)
            .ok_or(ProtocolError::UnknownMethodKey(method_key))?;

        let mut parameters = Vec::with_capacity(*count);
        for _ in 0..*count {
            parameters.push(Bytes::copy_from_slice(reader.read_parameter()?));
        }
        let call = RecordedCall {
            method_key,
            parameters,
        };
        trace!(connection = connection.id(), %call, "recorded call");

        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());
        registry.record_call(call);
        Ok(())
    }
}

/// A client that records the calls it receives, for asserting on a server.
#[derive(Debug)]
pub struct TestClient<C = MsgPackCodec> {
    client: RpcClient,
    registries: HashMap<i32, Arc<CallRegistry>>,
    log: CallLog,
    receive_timeout: Duration,
    _codec: PhantomData<fn() -> C>,
}

impl<C: ParameterCodec> TestClient<C> {
    /// Create a builder.
    pub fn builder() -> TestClientBuilder<C> {
        TestClientBuilder::new()
    }

    /// The underlying client.
    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Wait for a call to `method_key` matching `predicate`.
    ///
    /// Each recorded call satisfies at most one wait.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] listing every call received so far if no match
    /// arrives within the receive timeout.
    pub async fn received<P>(&self, method_key: i32, predicate: P) -> Result<RecordedCall>
    where
        P: Fn(&RecordedCall) -> bool + Send + 'static,
    {
        let waiter = self.registry(method_key)?.intercept(predicate);
        match tokio::time::timeout(self.receive_timeout, waiter).await {
            Ok(Ok(call)) => Ok(call),
            _ => Err(RpcError::Timeout(format!(
                "no matching call to method {method_key} within {:?}, received: [{}]",
                self.receive_timeout,
                self.all_calls()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// All calls to `method_key`, in arrival order.
    pub fn received_calls(&self, method_key: i32) -> Result<Vec<RecordedCall>> {
        Ok(self.registry(method_key)?.calls())
    }

    /// Calls to `method_key` matching `predicate`, in arrival order.
    pub fn filter<P>(&self, method_key: i32, predicate: P) -> Result<Vec<RecordedCall>>
    where
        P: Fn(&RecordedCall) -> bool,
    {
        let mut calls = self.received_calls(method_key)?;
        calls.retain(|call| predicate(call));
        Ok(calls)
    }

    /// Every recorded call, across methods, in arrival order.
    pub fn all_calls(&self) -> Vec<RecordedCall> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call a method on the server.
    pub async fn call<P: ToParameters>(&self, method_key: i32, parameters: P) -> Result<()> {
        self.client.call::<C, P>(method_key, parameters).await
    }

    /// Close the connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await
    }

    fn registry(&self, method_key: i32) -> Result<&CallRegistry> {
        self.registries
            .get(&method_key)
            .map(Arc::as_ref)
            .ok_or_else(|| {
                RpcError::Registration(format!("method key {method_key} is not recorded"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KEEP_ALIVE_FRAME;
    use crate::transport::pair;

    async fn connected(
        builder: TestClientBuilder<MsgPackCodec>,
    ) -> (TestClient<MsgPackCodec>, Connection) {
        let (local, server) = pair();
        let server = Connection::new(Arc::new(server) as Arc<dyn Transport>);
        server.send_raw(&KEEP_ALIVE_FRAME).await.unwrap();
        let client = builder.connect(Arc::new(local)).await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_reserved_and_duplicate_keys() {
        let (local, _server) = pair();
        let err = TestClient::<MsgPackCodec>::builder()
            .method(0, 0)
            .connect(Arc::new(local))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Registration(_)));

        let (local, _server) = pair();
        let err = TestClient::<MsgPackCodec>::builder()
            .method(3, 1)
            .method(3, 2)
            .connect(Arc::new(local))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_records_calls() {
        let (client, server) = connected(TestClient::builder().method(4, 2).method(5, 0)).await;

        server
            .call::<MsgPackCodec, _>(4, ("bob", 3u8))
            .await
            .unwrap();
        server.call::<MsgPackCodec, _>(5, ()).await.unwrap();

        let call = client.received(5, |_| true).await.unwrap();
        assert!(call.parameters.is_empty());
        let call = client.received(4, |_| true).await.unwrap();
        assert_eq!(call.decode::<MsgPackCodec, String>(0).unwrap(), "bob");
        assert_eq!(call.decode::<MsgPackCodec, u8>(1).unwrap(), 3);

        let keys: Vec<_> = client.all_calls().iter().map(|c| c.method_key).collect();
        assert_eq!(keys, vec![4, 5]);
        assert_eq!(client.received_calls(4).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_method_for_counts_tuple_elements() {
        let (client, server) =
            connected(TestClient::builder().method_for::<(String, u32)>(6)).await;
        server
            .call::<MsgPackCodec, _>(6, ("alice", 42u32))
            .await
            .unwrap();

        let call = client.received(6, |_| true).await.unwrap();
        assert_eq!(call.parameters.len(), 2);
        assert_eq!(call.decode::<MsgPackCodec, u32>(1).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_filter_and_predicate() {
        let (client, server) = connected(TestClient::builder().method(1, 1)).await;
        for n in 0..4u8 {
            server.call::<MsgPackCodec, _>(1, (n,)).await.unwrap();
        }

        let call = client
            .received(1, |c| c.decode::<MsgPackCodec, u8>(0).ok() == Some(3))
            .await
            .unwrap();
        assert_eq!(call.decode::<MsgPackCodec, u8>(0).unwrap(), 3);

        let even = client
            .filter(1, |c| c.decode::<MsgPackCodec, u8>(0).unwrap() % 2 == 0)
            .unwrap();
        assert_eq!(even.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_lists_received_calls() {
        let (client, server) = connected(
            TestClient::builder()
                .method(1, 1)
                .method(2, 0)
                .receive_timeout(Duration::from_millis(50)),
        )
        .await;
        server.call::<MsgPackCodec, _>(1, (true,)).await.unwrap();
        client.received(1, |_| true).await.unwrap();

        let err = client.received(2, |_| true).await.unwrap_err();
        let RpcError::Timeout(message) = err else {
            panic!("expected timeout, got {err:?}");
        };
        assert!(message.contains("method 2"));
        assert!(message.contains("[1(1B)]"));
    }

    #[tokio::test]
    async fn test_unknown_key_terminates_client() {
        let (client, server) = connected(TestClient::builder().method(1, 0)).await;
        server.call::<MsgPackCodec, _>(9, ()).await.unwrap();

        client.client().wait_disconnected().await;
        let err = client.disconnect().await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::UnknownMethodKey(9))
        ));
    }

    #[tokio::test]
    async fn test_unrecorded_key_is_an_error() {
        let (client, _server) = connected(TestClient::builder()).await;
        assert!(matches!(
            client.received_calls(7),
            Err(RpcError::Registration(_))
        ));
    }
}
