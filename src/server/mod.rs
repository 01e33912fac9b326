//! Server runtime: accept transports and process their calls.
//!
//! An [`RpcServer`] pairs a [`Dispatcher`] with a [`ServerConfig`]. Each
//! accepted transport becomes a [`Connection`] processed by its own loop:
//!
//! 1. Run the dispatcher's connect hook
//! 2. Send the handshake frame (`00 00 00 00`)
//! 3. Receive frames and dispatch their calls in order
//! 4. Acknowledge the peer's close frame, or close on shutdown / inactivity
//! 5. Run the disconnect hook
//!
//! # Example
//!
//! ```ignore
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//! use wsrpc::{transport, RpcServer};
//!
//! let server = RpcServer::builder(registry)
//!     .inactivity_timeout(Duration::from_secs(30))
//!     .build();
//! let shutdown = CancellationToken::new();
//!
//! let listener = TcpListener::bind("127.0.0.1:9000").await?;
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let transport = transport::accept(stream).await?;
//!     server.spawn(Arc::new(transport), shutdown.clone());
//! }
//! ```

mod config;
mod process;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::Result;
use crate::handler::Dispatcher;
use crate::transport::Transport;

pub use config::{ServerBuilder, ServerConfig};

/// Processes connections with one dispatcher and one configuration.
///
/// Cheap to clone; clones share the dispatcher.
#[derive(Debug)]
pub struct RpcServer<D> {
    dispatcher: Arc<D>,
    config: Arc<ServerConfig>,
}

impl<D> Clone for RpcServer<D> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D: Dispatcher> RpcServer<D> {
    /// Create a builder for a server around `dispatcher`.
    pub fn builder(dispatcher: D) -> ServerBuilder<D> {
        ServerBuilder::new(dispatcher)
    }

    /// Create a server with the default configuration.
    pub fn new(dispatcher: D) -> Self {
        Self::with_config(dispatcher, ServerConfig::default())
    }

    /// Create a server with an explicit configuration.
    pub fn with_config(dispatcher: D, config: ServerConfig) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            config: Arc::new(config),
        }
    }

    /// The dispatcher calls are routed to.
    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Wrap `transport` in a connection using this server's writer buffers.
    pub fn connection(&self, transport: Arc<dyn Transport>) -> Connection {
        Connection::with_writer_options(transport, self.config.writer_buffer.clone())
    }

    /// Process `connection` until it closes.
    ///
    /// Returns `Ok(())` when the peer completed the close handshake.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Cancelled`](crate::RpcError::Cancelled) if `shutdown`
    ///   fired or the inactivity deadline passed
    /// - [`RpcError::InvalidState`](crate::RpcError::InvalidState) if the
    ///   connection was processed before
    /// - the transport, protocol or handler error that terminated the loop
    pub async fn process(&self, connection: &Connection, shutdown: &CancellationToken) -> Result<()> {
        process::process_connection(self.dispatcher.as_ref(), &self.config, connection, shutdown)
            .await
    }

    /// Process `transport` on a new task.
    pub fn spawn(
        &self,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> (Connection, JoinHandle<Result<()>>) {
        let connection = self.connection(transport);
        let server = self.clone();
        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { server.process(&connection, &shutdown).await })
        };
        (connection, task)
    }
}
