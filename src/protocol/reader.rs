//! Message reader: receive sink and call decoder.
//!
//! A [`MessageReader`] is filled through its receive sink
//! ([`receive_buffer`](MessageReader::receive_buffer) +
//! [`advance`](MessageReader::advance)) until the transport reports the end
//! of the frame, then decoded call by call:
//!
//! ```text
//! read_method_key() -> begin_parameter() -> parameter() -> end_parameter() -> ...
//! ```
//!
//! # Example
//!
//! ```
//! use wsrpc::protocol::{BufferOptions, MessageReader};
//!
//! let mut reader = MessageReader::new(BufferOptions::new(64, 1024));
//! reader.push(&[0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x68, 0x69]).unwrap();
//!
//! assert_eq!(reader.read_method_key().unwrap(), 1);
//! assert_eq!(reader.read_parameter().unwrap(), b"hi");
//! assert!(reader.end_of_message());
//! ```

use super::buffer::{BufferOptions, MessageBuffer};
use super::wire_format::{decode_i32, LENGTH_PREFIX_SIZE, METHOD_KEY_SIZE};
use crate::error::{ProtocolError, Result, RpcError};

/// Decoder for one received message at a time.
#[derive(Debug)]
pub struct MessageReader {
    buffer: MessageBuffer,
    offset: usize,
    parameter_size: Option<usize>,
    max_parameter_size: Option<usize>,
}

impl MessageReader {
    /// Create a reader without a per-parameter size limit.
    pub fn new(options: BufferOptions) -> Self {
        Self {
            buffer: MessageBuffer::new(options),
            offset: 0,
            parameter_size: None,
            max_parameter_size: None,
        }
    }

    /// Reject parameters larger than `max` bytes with [`RpcError::BufferOverflow`].
    pub fn with_max_parameter_size(mut self, max: usize) -> Self {
        self.max_parameter_size = Some(max);
        self
    }

    /// Writable space for the next transport receive.
    ///
    /// Always at least one byte long; grows the buffer as needed.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::BufferOverflow`] if the message outgrew the
    /// configured maximum.
    pub fn receive_buffer(&mut self) -> Result<&mut [u8]> {
        debug_assert_eq!(self.offset, 0, "receive buffer used while decoding, missing reset()?");
        self.buffer.ensure_at_least(1)?;
        Ok(self.buffer.spare_mut())
    }

    /// Mark `count` bytes of the receive buffer as received.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        debug_assert_eq!(self.offset, 0, "receive buffer used while decoding, missing reset()?");
        self.buffer.consume(count);
    }

    /// Copy `data` into the receive buffer.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.buffer.ensure_at_least(data.len())?;
        self.buffer.spare_mut()[..data.len()].copy_from_slice(data);
        self.buffer.consume(data.len());
        Ok(())
    }

    /// Whether every received byte has been decoded.
    #[inline]
    pub fn end_of_message(&self) -> bool {
        self.offset == self.buffer.consumed()
    }

    /// Number of received bytes not yet decoded.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buffer.consumed() - self.offset
    }

    /// Decode the next method key.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TruncatedMessage`] if fewer than four bytes remain.
    pub fn read_method_key(&mut self) -> Result<i32> {
        debug_assert!(
            self.parameter_size.is_none(),
            "method key read while a parameter is open, missing end_parameter()?"
        );
        let key = decode_i32(&self.buffer.written()[self.offset..]).ok_or(
            ProtocolError::TruncatedMessage {
                field: "method key",
                needed: METHOD_KEY_SIZE,
                remaining: self.remaining(),
            },
        )?;
        self.offset += METHOD_KEY_SIZE;
        Ok(key)
    }

    /// Decode and validate the next parameter's length prefix.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::TruncatedMessage`] if the prefix itself is incomplete
    /// - [`ProtocolError::InvalidParameterLength`] if the length is negative or
    ///   exceeds the rest of the message
    /// - [`RpcError::BufferOverflow`] if a maximum parameter size is configured
    ///   and exceeded
    pub fn begin_parameter(&mut self) -> Result<usize> {
        debug_assert!(
            self.parameter_size.is_none(),
            "parameter already open, missing end_parameter()?"
        );
        let remaining = self.remaining();
        let length = decode_i32(&self.buffer.written()[self.offset..]).ok_or(
            ProtocolError::TruncatedMessage {
                field: "parameter length",
                needed: LENGTH_PREFIX_SIZE,
                remaining,
            },
        )?;

        let available = remaining - LENGTH_PREFIX_SIZE;
        let size = usize::try_from(length)
            .ok()
            .filter(|&size| size <= available)
            .ok_or(ProtocolError::InvalidParameterLength {
                length,
                remaining: available,
            })?;

        if let Some(maximum) = self.max_parameter_size {
            if size > maximum {
                return Err(RpcError::BufferOverflow {
                    requested: size,
                    maximum,
                });
            }
        }

        self.offset += LENGTH_PREFIX_SIZE;
        self.parameter_size = Some(size);
        Ok(size)
    }

    /// Bytes of the parameter opened by [`begin_parameter`](Self::begin_parameter).
    #[inline]
    pub fn parameter(&self) -> &[u8] {
        debug_assert!(self.parameter_size.is_some(), "begin_parameter() was never called");
        let size = self.parameter_size.unwrap_or(0);
        &self.buffer.written()[self.offset..self.offset + size]
    }

    /// Skip past the open parameter.
    #[inline]
    pub fn end_parameter(&mut self) {
        debug_assert!(self.parameter_size.is_some(), "begin_parameter() was never called");
        self.offset += self.parameter_size.take().unwrap_or(0);
    }

    /// Read one whole parameter: begin, borrow the bytes, end.
    pub fn read_parameter(&mut self) -> Result<&[u8]> {
        let size = self.begin_parameter()?;
        let start = self.offset;
        self.offset += size;
        self.parameter_size = None;
        Ok(&self.buffer.written()[start..start + size])
    }

    /// Release the buffer and rewind for the next message.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.offset = 0;
        self.parameter_size = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TrackingPool;
    use std::sync::Arc;

    fn reader_with(data: &[u8]) -> MessageReader {
        let mut reader = MessageReader::new(BufferOptions::new(1024, 1024 * 1024));
        reader.push(data).unwrap();
        reader
    }

    #[test]
    fn test_method_key_needs_four_bytes() {
        let mut reader = reader_with(&[0x0]);
        let err = reader.read_method_key().unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::TruncatedMessage {
                field: "method key",
                remaining: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_reads_method_key_and_end_of_message() {
        let mut reader = reader_with(&[0x0, 0x0, 0x0, 0x0]);
        assert!(!reader.end_of_message());
        assert_eq!(reader.read_method_key().unwrap(), 0);
        assert!(reader.end_of_message());
    }

    #[test]
    fn test_missing_length_prefix() {
        let mut reader = reader_with(&[0x1, 0x0, 0x0, 0x0]);
        reader.read_method_key().unwrap();
        let err = reader.begin_parameter().unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::TruncatedMessage {
                field: "parameter length",
                ..
            })
        ));
    }

    #[test]
    fn test_negative_parameter_length() {
        let mut reader = reader_with(&[0x1, 0x0, 0x0, 0x0, 0xff, 0xff, 0xff, 0xff]);
        reader.read_method_key().unwrap();
        let err = reader.begin_parameter().unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::InvalidParameterLength { length: -1, .. })
        ));
    }

    #[test]
    fn test_parameter_length_exceeds_message() {
        let mut reader = reader_with(&[0x1, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0]);
        reader.read_method_key().unwrap();
        let err = reader.begin_parameter().unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::InvalidParameterLength {
                length: 1,
                remaining: 0
            })
        ));
    }

    #[test]
    fn test_reads_example_call() {
        let mut reader = reader_with(&[0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x68, 0x69]);
        assert_eq!(reader.read_method_key().unwrap(), 1);
        assert_eq!(reader.begin_parameter().unwrap(), 2);
        assert_eq!(reader.parameter(), b"hi");
        reader.end_parameter();
        assert!(reader.end_of_message());
    }

    #[test]
    fn test_reads_multiple_methods() {
        let mut reader = reader_with(&[
            0x1, 0x0, 0x0, 0x0, // method 1
            0x1, 0x0, 0x0, 0x0, 0x1, // parameter [1]
            0x0, 0x1, 0x0, 0x0, // method 256
            0x2, 0x0, 0x0, 0x0, 0x2, 0x3, // parameter [2, 3]
        ]);

        assert_eq!(reader.read_method_key().unwrap(), 1);
        assert_eq!(reader.read_parameter().unwrap(), &[0x1]);
        assert_eq!(reader.read_method_key().unwrap(), 256);
        assert_eq!(reader.read_parameter().unwrap(), &[0x2, 0x3]);
        assert!(reader.end_of_message());
    }

    #[test]
    fn test_empty_parameter() {
        let mut reader = reader_with(&[0x5, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0]);
        assert_eq!(reader.read_method_key().unwrap(), 5);
        assert!(reader.read_parameter().unwrap().is_empty());
        assert!(reader.end_of_message());
    }

    #[test]
    fn test_max_parameter_size() {
        let mut reader = MessageReader::new(BufferOptions::new(64, 1024)).with_max_parameter_size(1);
        reader
            .push(&[0x1, 0x0, 0x0, 0x0, 0x2, 0x0, 0x0, 0x0, 0xaa, 0xbb])
            .unwrap();
        reader.read_method_key().unwrap();
        assert!(matches!(
            reader.begin_parameter(),
            Err(RpcError::BufferOverflow {
                requested: 2,
                maximum: 1
            })
        ));
    }

    #[test]
    fn test_partial_receives_accumulate() {
        let mut reader = MessageReader::new(BufferOptions::new(4, 64));
        for chunk in [&[0x7, 0x0][..], &[0x0, 0x0, 0x1], &[0x0, 0x0, 0x0, 0x2a]] {
            let mut rest = chunk;
            while !rest.is_empty() {
                let buf = reader.receive_buffer().unwrap();
                let count = buf.len().min(rest.len());
                buf[..count].copy_from_slice(&rest[..count]);
                reader.advance(count);
                rest = &rest[count..];
            }
        }
        assert_eq!(reader.read_method_key().unwrap(), 7);
        assert_eq!(reader.read_parameter().unwrap(), &[0x2a]);
        assert!(reader.end_of_message());
    }

    #[test]
    fn test_reuse_after_reset_releases_buffer() {
        let pool = Arc::new(TrackingPool::new());
        let mut reader = MessageReader::new(BufferOptions::with_pool(pool.clone(), 16, 1024));
        for _ in 0..2 {
            reader
                .push(&[0x2, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x3])
                .unwrap();
            assert_eq!(reader.read_method_key().unwrap(), 2);
            assert_eq!(reader.read_parameter().unwrap(), &[0x3]);
            reader.reset();
            assert_eq!(pool.outstanding(), 0);
        }
    }
}
