//! MsgPack codec using `rmp-serde`.
//!
//! Always encodes with `write_named`: structs are written as maps keyed by
//! field name rather than positional arrays, so peers in other languages
//! can decode them without knowing the field order.
//!
//! # Example
//!
//! ```
//! use wsrpc::codec::{MsgPackCodec, ParameterCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Position {
//!     x: f32,
//!     y: f32,
//! }
//!
//! let pos = Position { x: 1.0, y: 2.5 };
//! let encoded = MsgPackCodec::to_vec(&pos).unwrap();
//! let decoded: Position = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, pos);
//! ```

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ParameterCodec;
use crate::error::Result;

/// MessagePack codec for parameter values.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl ParameterCodec for MsgPackCodec {
    #[inline]
    fn encode<T, W>(value: &T, mut writer: W) -> Result<()>
    where
        T: Serialize + ?Sized,
        W: io::Write,
    {
        // Named, never positional
        rmp_serde::encode::write_named(&mut writer, value)?;
        Ok(())
    }

    #[inline]
    fn decode<T>(bytes: &[u8]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
