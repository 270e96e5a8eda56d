//! MsgPack codec using `rmp-serde`.
//!
//! Always `to_vec_named`: structs travel as maps with field names, so peers
//! written against a different struct layout still decode them.
//!
//! This is the safe serializer. It refuses typed [`Value::Object`](crate::Value::Object)
//! records in both directions, so a peer can never make us build an arbitrary
//! typed object.
//!
//! # Example
//!
//! ```
//! use skywire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use super::WireMessage;
use crate::error::CodecError;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode a wire message, rejecting typed objects.
    pub fn encode_safe<T: WireMessage>(msg: &T) -> Result<Vec<u8>, CodecError> {
        if msg.contains_objects() {
            return Err(Self::unsupported());
        }
        Self::encode(msg)
    }

    /// Decode a wire message, rejecting typed objects.
    pub fn decode_safe<T: WireMessage>(bytes: &[u8]) -> Result<T, CodecError> {
        let msg: T = Self::decode(bytes)?;
        if msg.contains_objects() {
            return Err(Self::unsupported());
        }
        Ok(msg)
    }

    fn unsupported() -> CodecError {
        CodecError::Unsupported {
            serializer: "msgpack",
            reason: "typed objects require the bincode serializer".to_string(),
        }
    }
}
