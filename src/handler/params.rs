//! Conversion between parameter tuples and encoded parameters.
//!
//! Each tuple element is one wire parameter, encoded on its own by the
//! connection's [`ParameterCodec`]. Implemented for `()` and tuples of up
//! to six elements.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::ParameterCodec;
use crate::error::Result;
use crate::protocol::{MessageReader, MessageWriter};

/// A tuple of parameters decodable from a call.
pub trait FromParameters: Sized + Send + 'static {
    /// Number of wire parameters consumed.
    const COUNT: usize;

    /// Read [`COUNT`](Self::COUNT) parameters from `reader`.
    fn read_parameters<C: ParameterCodec>(reader: &mut MessageReader) -> Result<Self>;
}

/// A tuple of parameters encodable into a call.
pub trait ToParameters {
    /// Append one parameter per element to `writer`.
    fn write_parameters<C: ParameterCodec>(&self, writer: &mut MessageWriter) -> Result<()>;
}

impl FromParameters for () {
    const COUNT: usize = 0;

    #[inline]
    fn read_parameters<C: ParameterCodec>(_reader: &mut MessageReader) -> Result<Self> {
        Ok(())
    }
}

impl ToParameters for () {
    #[inline]
    fn write_parameters<C: ParameterCodec>(&self, _writer: &mut MessageWriter) -> Result<()> {
        Ok(())
    }
}

macro_rules! count {
    () => { 0 };
    ($head:ident $($tail:ident)*) => { 1 + count!($($tail)*) };
}

macro_rules! impl_parameters {
    ($($name:ident : $index:tt),+) => {
        impl<$($name),+> FromParameters for ($($name,)+)
        where
            $($name: DeserializeOwned + Send + 'static),+
        {
            const COUNT: usize = count!($($name)+);

            fn read_parameters<C: ParameterCodec>(reader: &mut MessageReader) -> Result<Self> {
                Ok(($(C::decode::<$name>(reader.read_parameter()?)?,)+))
            }
        }

        impl<$($name),+> ToParameters for ($($name,)+)
        where
            $($name: Serialize),+
        {
            fn write_parameters<C: ParameterCodec>(&self, writer: &mut MessageWriter) -> Result<()> {
                $(writer.encode_parameter::<C, _>(&self.$index)?;)+
                Ok(())
            }
        }
    };
}

impl_parameters!(A: 0);
impl_parameters!(A: 0, B: 1);
impl_parameters!(A: 0, B: 1, C2: 2);
impl_parameters!(A: 0, B: 1, C2: 2, D: 3);
impl_parameters!(A: 0, B: 1, C2: 2, D: 3, E: 4);
impl_parameters!(A: 0, B: 1, C2: 2, D: 3, E: 4, F: 5);
