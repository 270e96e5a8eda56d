//! Bincode codec for trusted, same-version peers.
//!
//! Carries every [`Value`](crate::Value) variant, typed objects included.
//! Bincode is not self-describing, so both ends must share the exact message
//! definitions.

use crate::error::CodecError;

/// Bincode codec (object mode).
pub struct BincodeCodec;

impl BincodeCodec {
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(value)?)
    }

    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
