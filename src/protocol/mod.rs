//! Protocol module - wire format, pooled buffers and the call codec.
//!
//! This module implements the binary framing shared by both peers:
//! - Little-endian method keys and length-prefixed parameters
//! - A growable buffer renting its storage from a shared pool
//! - [`MessageReader`] / [`MessageWriter`] on top of that buffer

mod buffer;
mod pool;
mod reader;
mod wire_format;
mod writer;

pub use buffer::{BufferOptions, MessageBuffer};
pub use pool::{BufferPool, SharedBufferPool, DEFAULT_ARRAYS_PER_CLASS};
pub use reader::MessageReader;
pub use wire_format::{
    decode_i32, encode_i32_into, is_keep_alive, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_MAX_PARAMETER_SIZE, DEFAULT_MAX_WRITER_SIZE, DEFAULT_RECEIVE_BUFFER_SIZE,
    DEFAULT_WRITER_BUFFER_SIZE, KEEP_ALIVE_FRAME, KEEP_ALIVE_METHOD_KEY, LENGTH_PREFIX_SIZE,
    MAX_BUFFER_SIZE, METHOD_KEY_SIZE,
};
pub use writer::{MessageWriter, ParameterSink};
