//! Wire format constants and primitive encoding.
//!
//! Every integer on the wire is a signed 32-bit little-endian value:
//! ```text
//! Message   := Call*                  (bounded by the transport frame)
//! Call      := MethodKey Parameter*
//! MethodKey := i32                    (0 = keep-alive / handshake)
//! Parameter := i32(length) u8[length]
//! ```
//!
//! A message carries no length of its own; the transport delimits frames
//! and the parameter length prefixes delimit everything inside a frame.

/// Size of an encoded method key in bytes.
pub const METHOD_KEY_SIZE: usize = 4;

/// Size of a parameter length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest buffer a length prefix can describe.
pub const MAX_BUFFER_SIZE: usize = i32::MAX as usize;

/// Reserved method key for the keep-alive and handshake signal.
pub const KEEP_ALIVE_METHOD_KEY: i32 = 0;

/// The standalone keep-alive/handshake frame: method key `0`, no parameters.
pub const KEEP_ALIVE_FRAME: [u8; METHOD_KEY_SIZE] = [0, 0, 0, 0];

/// Default minimum size of receive buffers (8 KiB).
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 8 * 1024;

/// Default maximum size of a received message (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default minimum size of writer buffers (1 KiB).
pub const DEFAULT_WRITER_BUFFER_SIZE: usize = 1024;

/// Default maximum size of a written message (64 KiB).
pub const DEFAULT_MAX_WRITER_SIZE: usize = 64 * 1024;

/// Default maximum size of a single received parameter (4 KiB).
pub const DEFAULT_MAX_PARAMETER_SIZE: usize = 4 * 1024;

/// Encode an `i32` into the first four bytes of `buf`.
///
/// # Panics
///
/// Panics if `buf` is shorter than four bytes.
#[inline]
pub fn encode_i32_into(buf: &mut [u8], value: i32) {
    buf[..4].copy_from_slice(&value.to_le_bytes());
}

/// Decode an `i32` from the first four bytes of `buf`.
///
/// Returns `None` if the buffer is too short.
///
/// # Example
///
/// ```
/// use wsrpc::protocol::decode_i32;
///
/// assert_eq!(decode_i32(&[0x01, 0x00, 0x00, 0x00]), Some(1));
/// assert_eq!(decode_i32(&[0xff, 0xff, 0xff, 0xff]), Some(-1));
/// assert_eq!(decode_i32(&[0x01, 0x00]), None);
/// ```
#[inline]
pub fn decode_i32(buf: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

/// Check whether a method key is the reserved keep-alive key.
#[inline]
pub fn is_keep_alive(method_key: i32) -> bool {
    method_key == KEEP_ALIVE_METHOD_KEY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_byte_order() {
        let mut buf = [0u8; 4];
        encode_i32_into(&mut buf, 0x0403_0201);
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_negative_values_roundtrip() {
        let mut buf = [0u8; 4];
        encode_i32_into(&mut buf, -2);
        assert_eq!(buf, [0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(decode_i32(&buf), Some(-2));
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert_eq!(decode_i32(&[0, 0, 0]), None);
        assert_eq!(decode_i32(&[]), None);
    }

    #[test]
    fn test_keep_alive_frame() {
        assert_eq!(decode_i32(&KEEP_ALIVE_FRAME), Some(KEEP_ALIVE_METHOD_KEY));
        assert!(is_keep_alive(0));
        assert!(!is_keep_alive(1));
    }
}
