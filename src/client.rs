//! Client builder and runtime loop.
//!
//! The client is the other end of a server connection. The roles are
//! reversed: the server's handshake frame (method key `0`) marks the client
//! as connected, every other call goes to the client's [`Dispatcher`].
//!
//! The [`ClientBuilder`] configures buffers, readiness timeout and optional
//! keep-alive pings. The [`RpcClient`] manages the lifecycle:
//! 1. Run the dispatcher's connect hook
//! 2. Receive frames and dispatch their calls in order
//! 3. Ping the server every `ping_interval`
//! 4. Close the transport on [`RpcClient::disconnect`]
//!
//! # Example
//!
//! ```ignore
//! use wsrpc::{transport, RpcClient};
//!
//! let transport = transport::connect("ws://127.0.0.1:9000").await?;
//! let client = RpcClient::builder()
//!     .ping_interval(Duration::from_secs(10))
//!     .start(Arc::new(transport), registry);
//!
//! client.wait_connected().await?;
//! client.call::<MsgPackCodec, _>(JOIN_ROOM, ("lobby",)).await?;
//! client.disconnect().await?;
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, trace, warn};

use crate::codec::ParameterCodec;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Result, RpcError};
use crate::handler::{dispatch_message, Dispatcher, ToParameters};
use crate::protocol::{
    BufferOptions, BufferPool, MessageReader, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_MAX_PARAMETER_SIZE, DEFAULT_MAX_WRITER_SIZE, DEFAULT_RECEIVE_BUFFER_SIZE,
    DEFAULT_WRITER_BUFFER_SIZE, KEEP_ALIVE_FRAME,
};
use crate::time::{Clock, TokioClock};
use crate::transport::{receive_message, Received, Transport, TransportState};

/// Default time to wait for the handshake and for the receive loop to end.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Buffers received frames are assembled in.
    pub receive_buffer: BufferOptions,
    /// Buffers outgoing calls are encoded into.
    pub writer_buffer: BufferOptions,
    /// Largest accepted parameter.
    pub max_parameter_size: Option<usize>,
    /// Send a keep-alive this often. `None` disables pings.
    pub ping_interval: Option<Duration>,
    /// Real-time limit for [`RpcClient::wait_connected`] and the receive
    /// loop's shutdown in [`RpcClient::disconnect`].
    pub receive_timeout: Duration,
    /// Time source for pings.
    pub clock: Arc<dyn Clock>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            receive_buffer: BufferOptions::new(
                DEFAULT_RECEIVE_BUFFER_SIZE,
                DEFAULT_MAX_MESSAGE_SIZE,
            ),
            writer_buffer: BufferOptions::new(DEFAULT_WRITER_BUFFER_SIZE, DEFAULT_MAX_WRITER_SIZE),
            max_parameter_size: Some(DEFAULT_MAX_PARAMETER_SIZE),
            ping_interval: None,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            clock: Arc::new(TokioClock),
        }
    }
}

/// Builder for configuring and starting an [`RpcClient`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rent all buffers from `pool`.
    pub fn buffer_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.config.receive_buffer.pool = pool.clone();
        self.config.writer_buffer.pool = pool;
        self
    }

    /// Minimum and maximum size of the receive buffer.
    ///
    /// Default: 8 KiB / 64 KiB
    pub fn receive_buffer_size(mut self, minimum: usize, maximum: usize) -> Self {
        self.config.receive_buffer.minimum_size = minimum;
        self.config.receive_buffer.maximum_size = maximum;
        self
    }

    /// Minimum and maximum size of writer buffers.
    ///
    /// Default: 1 KiB / 64 KiB
    pub fn writer_buffer_size(mut self, minimum: usize, maximum: usize) -> Self {
        self.config.writer_buffer.minimum_size = minimum;
        self.config.writer_buffer.maximum_size = maximum;
        self
    }

    /// Largest accepted parameter.
    ///
    /// Default: 4 KiB
    pub fn max_parameter_size(mut self, max: Option<usize>) -> Self {
        self.config.max_parameter_size = max;
        self
    }

    /// Send a keep-alive every `interval`.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = Some(interval);
        self
    }

    /// Set the readiness and shutdown timeout.
    ///
    /// Default: 5 seconds
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout = timeout;
        self
    }

    /// Drive pings from `clock` instead of tokio time.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.config.clock = clock;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start the client on `transport`, routing calls to `dispatcher`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<D: Dispatcher>(self, transport: Arc<dyn Transport>, dispatcher: D) -> RpcClient {
        RpcClient::start(self.config, transport, Arc::new(dispatcher))
    }
}

/// A running client.
///
/// Dropping the client cancels its connection.
#[derive(Debug)]
pub struct RpcClient {
    connection: Connection,
    config: ClientConfig,
    connected: watch::Receiver<bool>,
    receive_task: Mutex<Option<JoinHandle<Result<()>>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn start<D: Dispatcher>(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<D>,
    ) -> Self {
        let connection = Connection::with_writer_options(transport, config.writer_buffer.clone());
        let (connected_tx, connected) = watch::channel(false);

        let receive_task = tokio::spawn(run(
            dispatcher,
            config.clone(),
            connection.clone(),
            connected_tx,
        ));
        let ping_task = config
            .ping_interval
            .map(|interval| spawn_pings(connection.clone(), config.clock.clone(), interval));

        Self {
            connection,
            config,
            connected,
            receive_task: Mutex::new(Some(receive_task)),
            ping_task: Mutex::new(ping_task),
        }
    }

    /// The connection to the server.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether the server's handshake arrived.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait for the server's handshake frame.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] if no handshake arrives within the receive timeout
    /// - [`RpcError::TransportClosed`] if the receive loop ended first
    pub async fn wait_connected(&self) -> Result<()> {
        let mut connected = self.connected.clone();
        let timeout = self.config.receive_timeout;
        let waited = tokio::time::timeout(timeout, connected.wait_for(|&c| c))
            .await
            .map(|ready| ready.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RpcError::TransportClosed),
            Err(_) => Err(RpcError::Timeout(format!(
                "no handshake from the server within {timeout:?}"
            ))),
        }
    }

    /// Encode one call with codec `C` and send it to the server.
    pub async fn call<C, P>(&self, method_key: i32, parameters: P) -> Result<()>
    where
        C: ParameterCodec,
        P: ToParameters,
    {
        self.connection.call::<C, P>(method_key, parameters).await
    }

    /// Wait until the connection is disconnected, by either side.
    pub async fn wait_disconnected(&self) {
        self.connection.disconnected().cancelled().await;
    }

    /// Close the connection and wait for the receive loop to end.
    ///
    /// Sends a close frame and waits up to the receive timeout for the
    /// server's acknowledgement before cancelling the connection.
    ///
    /// # Errors
    ///
    /// The error that ended the receive loop, if it was not the close
    /// handshake or cancellation. Calling `disconnect` again returns `Ok`.
    pub async fn disconnect(&self) -> Result<()> {
        if let Some(ping) = take(&self.ping_task) {
            ping.abort();
        }
        let Some(mut task) = take(&self.receive_task) else {
            return Ok(());
        };

        if !self.connection.is_disconnected() {
            if let Err(e) = self.connection.transport().close_output().await {
                debug!(connection = self.connection.id(), error = %e, "close frame failed");
            }
        }

        let joined = match tokio::time::timeout(self.config.receive_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!(
                    connection = self.connection.id(),
                    "no close acknowledgement, cancelling connection"
                );
                self.connection.cancel();
                task.await
            }
        };

        match flatten(joined) {
            Err(RpcError::Cancelled) => Ok(()),
            result => result,
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.connection.cancel();
        if let Some(ping) = take(&self.ping_task) {
            ping.abort();
        }
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(RpcError::Cancelled),
    }
}

/// Receive loop of one client connection, hooks included.
async fn run<D: Dispatcher>(
    dispatcher: Arc<D>,
    config: ClientConfig,
    connection: Connection,
    connected: watch::Sender<bool>,
) -> Result<()> {
    connection.set_state(ConnectionState::Connected);
    if let Err(e) = dispatcher.on_connected(&connection).await {
        warn!(connection = connection.id(), error = %e, "connect hook failed");
        connection.cancel();
        connection.set_state(ConnectionState::Disconnected);
        return Err(e);
    }

    let result = receive_loop(dispatcher.as_ref(), &config, &connection, &connected).await;

    connection.set_state(ConnectionState::Disconnecting);
    connection.cancel();
    dispatcher.on_disconnected(&connection).await;
    connection.set_state(ConnectionState::Disconnected);

    match &result {
        Ok(()) => debug!(connection = connection.id(), "client connection closed"),
        Err(e) if e.is_cancelled() => debug!(connection = connection.id(), "client connection cancelled"),
        Err(e) if e.is_protocol() => {
            warn!(connection = connection.id(), error = %e, "protocol violation from server")
        }
        Err(e) => error!(connection = connection.id(), error = %e, "client connection failed"),
    }
    result
}

async fn receive_loop<D: Dispatcher>(
    dispatcher: &D,
    config: &ClientConfig,
    connection: &Connection,
    connected: &watch::Sender<bool>,
) -> Result<()> {
    let transport = connection.transport().as_ref();
    let cancel = connection.disconnected();
    let mut reader = MessageReader::new(config.receive_buffer.clone());
    if let Some(max) = config.max_parameter_size {
        reader = reader.with_max_parameter_size(max);
    }

    // Keep receiving after our own close frame until the server acknowledges it
    while matches!(
        transport.state(),
        TransportState::Open | TransportState::CloseSent
    ) {
        connection.set_state(ConnectionState::Receiving);
        if receive_message(transport, &mut reader, &cancel).await? == Received::Close {
            debug!(connection = connection.id(), "server closed the connection");
            if let Err(e) = transport.close_output().await {
                debug!(connection = connection.id(), error = %e, "close acknowledgement failed");
            }
            return Ok(());
        }

        connection.set_state(ConnectionState::Dispatching);
        let result = dispatch_message(dispatcher, connection, &mut reader, || {
            if !connected.send_replace(true) {
                trace!(connection = connection.id(), "handshake received");
            }
            Ok(())
        })
        .await;
        reader.reset();
        result?;
    }
    Ok(())
}

fn spawn_pings(connection: Connection, clock: Arc<dyn Clock>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let disconnected = connection.disconnected();
        loop {
            let deadline = clock.now() + interval;
            tokio::select! {
                biased;
                _ = disconnected.cancelled() => return,
                _ = clock.sleep_until(deadline) => {}
            }
            if let Err(e) = connection.send_raw(&KEEP_ALIVE_FRAME).await {
                debug!(connection = connection.id(), error = %e, "keep-alive failed");
                return;
            }
            trace!(connection = connection.id(), "keep-alive sent");
        }
    })
}
