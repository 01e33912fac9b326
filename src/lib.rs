//! # wsrpc
//!
//! Binary RPC runtime over WebSocket-style message transports.
//!
//! Each binary frame carries one or more calls. A call is a method key
//! followed by length-prefixed parameters:
//!
//! ```text
//! Message   := Call*
//! Call      := MethodKey Parameter*
//! MethodKey := i32 (LE)                  0 = keep-alive / handshake
//! Parameter := i32 (LE) length, bytes
//! ```
//!
//! ## Architecture
//!
//! - **Protocol**: pooled growable buffers with a [`MessageReader`] /
//!   [`MessageWriter`] pair
//! - **Transport**: WebSocket via `tokio-tungstenite`, in-memory pairs for tests
//! - **Server**: one sequential processing loop per connection, with
//!   graceful cancellation and an optional inactivity deadline
//! - **Client**: the same loop with roles reversed, plus keep-alive pings
//!
//! ## Example
//!
//! ```ignore
//! use wsrpc::{codec::MsgPackCodec, Connection, MethodRegistry, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> wsrpc::Result<()> {
//!     let mut registry = MethodRegistry::<MsgPackCodec>::new();
//!     registry.register(1, |connection: Connection, (text,): (String,)| async move {
//!         connection.call::<MsgPackCodec, _>(2, (text,)).await
//!     })?;
//!
//!     let server = RpcServer::builder(registry)
//!         .inactivity_timeout(std::time::Duration::from_secs(30))
//!         .build();
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9000").await?;
//!     let shutdown = tokio_util::sync::CancellationToken::new();
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let transport = wsrpc::transport::accept(stream).await?;
//!         server.spawn(std::sync::Arc::new(transport), shutdown.clone());
//!     }
//! }
//! ```

pub mod batch;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod testing;
pub mod time;
pub mod transport;

mod client;

pub use batch::{Batch, BroadcastReport};
pub use client::{ClientBuilder, ClientConfig, RpcClient, DEFAULT_RECEIVE_TIMEOUT};
pub use connection::{Connection, ConnectionState};
pub use error::{ProtocolError, Result, RpcError};
pub use handler::{Dispatcher, MethodRegistry};
pub use protocol::{MessageReader, MessageWriter};
pub use server::{RpcServer, ServerBuilder, ServerConfig};
