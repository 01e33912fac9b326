//! Codec module - serialization of individual parameter values.
//!
//! The wire protocol treats parameters as opaque bytes. A [`ParameterCodec`]
//! decides how typed values become those bytes:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (struct-as-map)
//! - [`JsonCodec`] - JSON using `serde_json`
//!
//! # Design
//!
//! Codecs are marker structs with static methods, selected at compile time
//! through a type parameter (`MethodRegistry<C>`, `Batch<C>`). Encoding
//! streams into any [`std::io::Write`], which the message writer backs with
//! its pooled buffer.
//!
//! # Example
//!
//! ```
//! use wsrpc::codec::{JsonCodec, MsgPackCodec, ParameterCodec};
//!
//! let mut encoded = Vec::new();
//! MsgPackCodec::encode(&"hello", &mut encoded).unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! let mut json = Vec::new();
//! JsonCodec::encode(&[1, 2, 3], &mut json).unwrap();
//! assert_eq!(json, b"[1,2,3]");
//! ```

mod json;
mod msgpack;

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Serialization format for parameter values.
pub trait ParameterCodec: Send + Sync + 'static {
    /// Serialize `value` into `writer`.
    fn encode<T, W>(value: &T, writer: W) -> Result<()>
    where
        T: Serialize + ?Sized,
        W: io::Write;

    /// Deserialize a value from one parameter's bytes.
    fn decode<T>(bytes: &[u8]) -> Result<T>
    where
        T: DeserializeOwned;

    /// Serialize `value` into a fresh vector.
    fn to_vec<T>(value: &T) -> Result<Vec<u8>>
    where
        T: Serialize + ?Sized,
    {
        let mut buf = Vec::new();
        Self::encode(value, &mut buf)?;
        Ok(buf)
    }
}
