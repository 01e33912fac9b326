//! Server configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::handler::Dispatcher;
use crate::protocol::{
    BufferOptions, BufferPool, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_PARAMETER_SIZE,
    DEFAULT_MAX_WRITER_SIZE, DEFAULT_RECEIVE_BUFFER_SIZE, DEFAULT_WRITER_BUFFER_SIZE,
};
use crate::time::{Clock, TokioClock};

/// Configuration shared by all connections of a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Buffers received frames are assembled in.
    pub receive_buffer: BufferOptions,
    /// Buffers handlers encode outgoing calls into.
    pub writer_buffer: BufferOptions,
    /// Largest accepted parameter, `None` for no limit beyond the receive buffer.
    pub max_parameter_size: Option<usize>,
    /// Close connections that send no keep-alive for this long.
    ///
    /// Without a timeout a keep-alive from the peer is a protocol violation.
    pub inactivity_timeout: Option<Duration>,
    /// Time source for the inactivity timer.
    pub clock: Arc<dyn Clock>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            receive_buffer: BufferOptions::new(
                DEFAULT_RECEIVE_BUFFER_SIZE,
                DEFAULT_MAX_MESSAGE_SIZE,
            ),
            writer_buffer: BufferOptions::new(DEFAULT_WRITER_BUFFER_SIZE, DEFAULT_MAX_WRITER_SIZE),
            max_parameter_size: Some(DEFAULT_MAX_PARAMETER_SIZE),
            inactivity_timeout: None,
            clock: Arc::new(TokioClock),
        }
    }
}

/// Fluent builder for [`RpcServer`](super::RpcServer).
#[derive(Debug)]
pub struct ServerBuilder<D> {
    dispatcher: D,
    config: ServerConfig,
}

impl<D> ServerBuilder<D> {
    pub(super) fn new(dispatcher: D) -> Self {
        Self {
            dispatcher,
            config: ServerConfig::default(),
        }
    }

    /// Rent all buffers from `pool`.
    pub fn buffer_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.config.receive_buffer.pool = pool.clone();
        self.config.writer_buffer.pool = pool;
        self
    }

    /// Minimum and maximum size of receive buffers.
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

    /// Enable the inactivity deadline.
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.config.inactivity_timeout = Some(timeout);
        self
    }

    /// Drive timers from `clock` instead of tokio time.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.config.clock = clock;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

}

impl<D: Dispatcher> ServerBuilder<D> {
    /// Build the server.
    pub fn build(self) -> super::RpcServer<D> {
        super::RpcServer::with_config(self.dispatcher, self.config)
    }
}
