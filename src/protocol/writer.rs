//! Message writer: call encoder on top of a pooled buffer.
//!
//! Parameters are framed by reserving the length prefix in
//! [`begin_parameter`](MessageWriter::begin_parameter) and back-filling it in
//! [`end_parameter`](MessageWriter::end_parameter), so parameter bytes can be
//! streamed straight into the buffer without knowing their size up front.
//!
//! # Example
//!
//! ```
//! use std::io::Write;
//! use wsrpc::protocol::{BufferOptions, MessageWriter};
//!
//! let mut writer = MessageWriter::new(BufferOptions::new(64, 1024));
//! writer.write_method_key(1).unwrap();
//! writer.begin_parameter().unwrap();
//! writer.parameter_sink().write_all(b"hi").unwrap();
//! writer.end_parameter();
//!
//! assert_eq!(
//!     writer.written(),
//!     &[0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x68, 0x69]
//! );
//! ```

use std::io;

use serde::Serialize;

use super::buffer::{BufferOptions, MessageBuffer};
use super::wire_format::{encode_i32_into, LENGTH_PREFIX_SIZE, METHOD_KEY_SIZE};
use crate::codec::ParameterCodec;
use crate::error::{Result, RpcError};

/// Encoder for one outgoing message at a time.
///
/// Not meant to be shared; independent writers can be used concurrently.
#[derive(Debug)]
pub struct MessageWriter {
    buffer: MessageBuffer,
    /// Offset of the first parameter byte, just past the reserved prefix.
    parameter_start: Option<usize>,
}

impl MessageWriter {
    /// Create an empty writer.
    pub fn new(options: BufferOptions) -> Self {
        Self {
            buffer: MessageBuffer::new(options),
            parameter_start: None,
        }
    }

    /// Append a method key.
    pub fn write_method_key(&mut self, method_key: i32) -> Result<()> {
        debug_assert!(
            self.parameter_start.is_none(),
            "method key written inside a parameter, missing end_parameter()?"
        );
        self.put_i32(method_key)
    }

    /// Reserve the length prefix of a new parameter.
    pub fn begin_parameter(&mut self) -> Result<()> {
        debug_assert!(
            self.parameter_start.is_none(),
            "parameter already open, missing end_parameter()?"
        );
        self.put_i32(0)?;
        self.parameter_start = Some(self.buffer.consumed());
        Ok(())
    }

    /// Byte sink for the open parameter.
    pub fn parameter_sink(&mut self) -> ParameterSink<'_> {
        debug_assert!(self.parameter_start.is_some(), "begin_parameter() was never called");
        ParameterSink {
            buffer: &mut self.buffer,
            overflow: None,
        }
    }

    /// Back-fill the open parameter's length prefix.
    pub fn end_parameter(&mut self) {
        debug_assert!(self.parameter_start.is_some(), "begin_parameter() was never called");
        let Some(start) = self.parameter_start.take() else {
            return;
        };
        let length = self.buffer.consumed() - start;
        let prefix = start - LENGTH_PREFIX_SIZE;
        // Buffers never exceed MAX_BUFFER_SIZE, so the length fits
        encode_i32_into(&mut self.buffer.written_mut()[prefix..start], length as i32);
    }

    /// Append a complete parameter from raw bytes.
    pub fn write_parameter(&mut self, data: &[u8]) -> Result<()> {
        self.begin_parameter()?;
        self.put_bytes(data)?;
        self.end_parameter();
        Ok(())
    }

    /// Append a complete parameter serialized by codec `C`.
    ///
    /// The value is encoded directly into the pooled buffer.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::BufferOverflow`] if the encoded value does not fit,
    /// or the codec's error if serialization fails. The writer should be
    /// [`reset`](Self::reset) after a failure.
    pub fn encode_parameter<C, T>(&mut self, value: &T) -> Result<()>
    where
        C: ParameterCodec,
        T: Serialize + ?Sized,
    {
        self.begin_parameter()?;
        let mut sink = self.parameter_sink();
        let result = C::encode(value, &mut sink);
        if let Some(overflow) = sink.take_overflow() {
            return Err(overflow);
        }
        result?;
        self.end_parameter();
        Ok(())
    }

    /// Writable space of at least `size_hint` bytes (one if zero).
    pub fn get_span(&mut self, size_hint: usize) -> Result<&mut [u8]> {
        self.buffer.ensure_at_least(size_hint.max(1))?;
        Ok(self.buffer.spare_mut())
    }

    /// Commit `count` bytes written into the span from [`get_span`](Self::get_span).
    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.buffer.consume(count);
    }

    /// Everything written so far.
    #[inline]
    pub fn written(&self) -> &[u8] {
        self.buffer.written()
    }

    /// Number of bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.consumed()
    }

    /// Whether nothing was written yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.consumed() == 0
    }

    /// Discard everything after the first `len` bytes, closing any open parameter.
    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
        self.parameter_start = None;
    }

    /// Release the buffer so the writer can start a new message.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.parameter_start = None;
    }

    fn put_i32(&mut self, value: i32) -> Result<()> {
        self.buffer.ensure_at_least(METHOD_KEY_SIZE)?;
        encode_i32_into(self.buffer.spare_mut(), value);
        self.buffer.consume(METHOD_KEY_SIZE);
        Ok(())
    }

    fn put_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.buffer.ensure_at_least(data.len())?;
        self.buffer.spare_mut()[..data.len()].copy_from_slice(data);
        self.buffer.consume(data.len());
        Ok(())
    }
}

/// [`io::Write`] view over the open parameter of a [`MessageWriter`].
#[derive(Debug)]
pub struct ParameterSink<'a> {
    buffer: &'a mut MessageBuffer,
    overflow: Option<(usize, usize)>,
}

impl ParameterSink<'_> {
    /// The buffer overflow that failed a previous write, if any.
    pub fn take_overflow(&mut self) -> Option<RpcError> {
        self.overflow
            .take()
            .map(|(requested, maximum)| RpcError::BufferOverflow { requested, maximum })
    }
}

impl io::Write for ParameterSink<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.buffer.ensure_at_least(data.len()) {
            if let RpcError::BufferOverflow { requested, maximum } = e {
                self.overflow = Some((requested, maximum));
            }
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, e));
        }
        self.buffer.spare_mut()[..data.len()].copy_from_slice(data);
        self.buffer.consume(data.len());
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
