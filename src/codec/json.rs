//! JSON codec using `serde_json`.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ParameterCodec;
use crate::error::Result;

/// JSON codec for parameter values.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ParameterCodec for JsonCodec {
    #[inline]
    fn encode<T, W>(value: &T, writer: W) -> Result<()>
    where
        T: Serialize + ?Sized,
        W: io::Write,
    {
        serde_json::to_writer(writer, value)?;
        Ok(())
    }

    #[inline]
    fn decode<T>(bytes: &[u8]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_slice(bytes)?)
    }
}
