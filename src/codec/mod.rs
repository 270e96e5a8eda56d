//! Codec module - serialization of wire messages.
//!
//! - [`MsgPackCodec`] - safe default, rejects typed objects
//! - [`BincodeCodec`] - trusted object mode, full fidelity
//!
//! [`Serializer`] selects one of them at runtime; it is part of a transport's
//! identity, so both ends of a link must agree on it.
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects.
//! The [`Serializer`] enum dispatches to them.
//!
//! # Example
//!
//! ```
//! use skywire::codec::Serializer;
//! use skywire::Value;
//!
//! let bytes = Serializer::MsgPack.dumps(&Value::Int(5)).unwrap();
//! let back: Value = Serializer::MsgPack.loads(&bytes).unwrap();
//! assert_eq!(back, Value::Int(5));
//! ```

mod bincode;
mod msgpack;

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use self::bincode::BincodeCodec;
pub use msgpack::MsgPackCodec;

use crate::error::CodecError;
use crate::Value;

/// Anything that travels as a top-level message.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Whether any carried value is a typed object.
    fn contains_objects(&self) -> bool;
}

impl WireMessage for Value {
    fn contains_objects(&self) -> bool {
        Value::contains_objects(self)
    }
}

/// Runtime choice of codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    #[default]
    MsgPack,
    Bincode,
}

impl Serializer {
    /// Serialize a message.
    pub fn dumps<T: WireMessage>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Serializer::MsgPack => MsgPackCodec::encode_safe(msg),
            Serializer::Bincode => BincodeCodec::encode(msg),
        }
    }

    /// Deserialize a message.
    pub fn loads<T: WireMessage>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Serializer::MsgPack => MsgPackCodec::decode_safe(bytes),
            Serializer::Bincode => BincodeCodec::decode(bytes),
        }
    }

    /// Whether typed objects survive a round trip.
    pub fn object_mode(&self) -> bool {
        matches!(self, Serializer::Bincode)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Serializer::MsgPack => "msgpack",
            Serializer::Bincode => "bincode",
        }
    }
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lossy wrapper for paths that must not fail.
///
/// Failures are logged and turned into `None`. RPC paths use
/// [`Serializer::dumps`]/[`Serializer::loads`] directly and propagate errors.
pub struct Serializable<T>(PhantomData<fn() -> T>);

impl<T: WireMessage> Serializable<T> {
    pub fn dump(serializer: Serializer, msg: &T) -> Option<Vec<u8>> {
        match serializer.dumps(msg) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Dropping unserializable {}: {}", std::any::type_name::<T>(), e);
                None
            }
        }
    }

    pub fn load(serializer: Serializer, bytes: &[u8]) -> Option<T> {
        match serializer.loads(bytes) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::warn!(
                    "Dropping undecodable {} ({} bytes): {}",
                    std::any::type_name::<T>(),
                    bytes.len(),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn object() -> Value {
        Value::Object {
            class: "Target".into(),
            fields: BTreeMap::from([("name".to_string(), Value::Str("M42".into()))]),
        }
    }

    #[test]
    fn test_object_mode() {
        assert!(!Serializer::MsgPack.object_mode());
        assert!(Serializer::Bincode.object_mode());
    }

    #[test]
    fn test_bincode_carries_objects_msgpack_refuses() {
        let bytes = Serializer::Bincode.dumps(&object()).unwrap();
        let back: Value = Serializer::Bincode.loads(&bytes).unwrap();
        assert_eq!(back, object());

        assert!(Serializer::MsgPack.dumps(&object()).is_err());
    }

    #[test]
    fn test_serializable_is_lossy() {
        assert!(Serializable::<Value>::dump(Serializer::MsgPack, &object()).is_none());
        assert!(Serializable::<Value>::load(Serializer::MsgPack, b"\xc1garbage").is_none());

        let bytes = Serializable::dump(Serializer::MsgPack, &Value::Int(1)).unwrap();
        assert_eq!(
            Serializable::<Value>::load(Serializer::MsgPack, &bytes),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn test_serializer_names_parse_from_config() {
        #[derive(Deserialize)]
        struct Cfg {
            serializer: Serializer,
        }
        let cfg: Cfg = toml::from_str("serializer = \"bincode\"").unwrap();
        assert_eq!(cfg.serializer, Serializer::Bincode);
    }
}
