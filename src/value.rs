//! Self-describing values carried in arguments, results, events and options.
//!
//! [`Value::Object`] is a typed record. Only the trusted object serializer can
//! carry it; the safe MsgPack serializer rejects it.
//!
//! # Example
//!
//! ```
//! use skywire::Value;
//!
//! let v = Value::from_serialize(&(2, "two")).unwrap();
//! assert_eq!(v, Value::List(vec![Value::Int(2), Value::Str("two".into())]));
//!
//! let back: (i64, String) = v.deserialize_into().unwrap();
//! assert_eq!(back, (2, "two".to_string()));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CodecError;

/// Field naming the class of an object in human-readable formats.
pub const CLASS_KEY: &str = "__class__";

/// A dynamically typed value.
///
/// Binary formats carry the variant tag. Human-readable formats (JSON, TOML)
/// see the plain value, with objects written as maps holding [`CLASS_KEY`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Typed record, trusted serializer only.
    Object {
        class: String,
        fields: BTreeMap<String, Value>,
    },
}

impl Value {
    /// Convert any serializable value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Ok(serde_json::from_value(serde_json::to_value(value)?)?)
    }

    /// Convert into any deserializable type.
    pub fn deserialize_into<T: DeserializeOwned>(self) -> Result<T, CodecError> {
        Ok(serde_json::from_value(serde_json::to_value(&self)?)?)
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object { .. } => "object",
        }
    }

    /// Whether this value, or anything nested in it, is a typed [`Value::Object`].
    pub fn contains_objects(&self) -> bool {
        match self {
            Value::Object { .. } => true,
            Value::List(items) => items.iter().any(Value::contains_objects),
            Value::Map(map) => map.values().any(Value::contains_objects),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as a float, accepting ints.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// Tagged form used by binary formats.
#[derive(Serialize)]
enum TaggedRef<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(&'a str),
    Bytes(#[serde(with = "serde_bytes")] &'a [u8]),
    List(&'a [Value]),
    Map(&'a BTreeMap<String, Value>),
    Object {
        class: &'a str,
        fields: &'a BTreeMap<String, Value>,
    },
}

#[derive(Deserialize)]
enum Tagged {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object {
        class: String,
        fields: BTreeMap<String, Value>,
    },
}

impl From<Tagged> for Value {
    fn from(tagged: Tagged) -> Self {
        match tagged {
            Tagged::Null => Value::Null,
            Tagged::Bool(b) => Value::Bool(b),
            Tagged::Int(i) => Value::Int(i),
            Tagged::Float(f) => Value::Float(f),
            Tagged::Str(s) => Value::Str(s),
            Tagged::Bytes(b) => Value::Bytes(b),
            Tagged::List(items) => Value::List(items),
            Tagged::Map(map) => Value::Map(map),
            Tagged::Object { class, fields } => Value::Object { class, fields },
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !serializer.is_human_readable() {
            let tagged = match self {
                Value::Null => TaggedRef::Null,
                Value::Bool(b) => TaggedRef::Bool(*b),
                Value::Int(i) => TaggedRef::Int(*i),
                Value::Float(f) => TaggedRef::Float(*f),
                Value::Str(s) => TaggedRef::Str(s),
                Value::Bytes(b) => TaggedRef::Bytes(b),
                Value::List(items) => TaggedRef::List(items),
                Value::Map(map) => TaggedRef::Map(map),
                Value::Object { class, fields } => TaggedRef::Object { class, fields },
            };
            return tagged.serialize(serializer);
        }

        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::List(items) => items.serialize(serializer),
            Value::Map(map) => map.serialize(serializer),
            Value::Object { class, fields } => {
                let mut out = serializer.serialize_map(Some(fields.len() + 1))?;
                out.serialize_entry(CLASS_KEY, class)?;
                for (key, value) in fields {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(PlainVisitor)
        } else {
            Tagged::deserialize(deserializer).map(Value::from)
        }
    }
}

struct PlainVisitor;

impl<'de> Visitor<'de> for PlainVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any value")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E>(self, i: i64) -> Result<Value, E> {
        Ok(Value::Int(i))
    }

    fn visit_u64<E>(self, u: u64) -> Result<Value, E> {
        Ok(i64::try_from(u).map(Value::Int).unwrap_or(Value::Float(u as f64)))
    }

    fn visit_f64<E>(self, f: f64) -> Result<Value, E> {
        Ok(Value::Float(f))
    }

    fn visit_str<E>(self, s: &str) -> Result<Value, E> {
        Ok(Value::Str(s.to_string()))
    }

    fn visit_string<E>(self, s: String) -> Result<Value, E> {
        Ok(Value::Str(s))
    }

    fn visit_bytes<E>(self, b: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(b.to_vec()))
    }

    fn visit_byte_buf<E>(self, b: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(b))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            map.insert(key, value);
        }
        match map.remove(CLASS_KEY) {
            Some(Value::Str(class)) => Ok(Value::Object { class, fields: map }),
            Some(other) => Err(de::Error::custom(format!(
                "{CLASS_KEY} must be a string, got {}",
                other.kind()
            ))),
            None => Ok(Value::Map(map)),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Value::from(f),
            Value::Str(s) => serde_json::Value::String(s),
            Value::Bytes(bytes) => serde_json::Value::from(bytes),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Map(map) | Value::Object { fields: map, .. } => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Build a `Vec<Value>` argument list.
///
/// ```
/// use skywire::{args, Value};
///
/// assert_eq!(args![1, "a"], vec![Value::Int(1), Value::Str("a".into())]);
/// ```
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::Value>::new() };
    ($($arg:expr),+ $(,)?) => { vec![$($crate::Value::from($arg)),+] };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Position {
        ra: f64,
        dec: f64,
    }

    #[test]
    fn test_struct_through_value() {
        let pos = Position { ra: 10.5, dec: -20.0 };
        let value = Value::from_serialize(&pos).unwrap();

        let map = value.as_map().unwrap();
        assert_eq!(map.get("ra"), Some(&Value::Float(10.5)));

        let back: Position = value.deserialize_into().unwrap();
        assert_eq!(back, pos);
    }

    #[test]
    fn test_contains_objects_nested() {
        let plain = Value::List(vec![Value::Int(1), Value::Map(BTreeMap::new())]);
        assert!(!plain.contains_objects());

        let nested = Value::Map(BTreeMap::from([(
            "frame".to_string(),
            Value::List(vec![Value::Object {
                class: "Image".into(),
                fields: BTreeMap::new(),
            }]),
        )]));
        assert!(nested.contains_objects());
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(3.5).as_i64(), None);
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_value_through_value_is_unchanged() {
        let values = vec![
            Value::Int(5),
            Value::Null,
            Value::List(vec![Value::Float(1.5), Value::from("x")]),
            Value::Object {
                class: "Point".into(),
                fields: BTreeMap::from([("x".to_string(), Value::Int(1))]),
            },
        ];
        for value in values {
            assert_eq!(Value::from_serialize(&value).unwrap(), value);
            let back: Value = value.clone().deserialize_into().unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn test_binary_formats_keep_tags() {
        let map = Value::Map(BTreeMap::from([(CLASS_KEY.to_string(), Value::from("x"))]));
        let bytes = rmp_serde::to_vec(&map).unwrap();
        let back: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, map);

        let bytes = bincode::serialize(&Value::Bytes(vec![1, 2, 3])).unwrap();
        let back: Value = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, Value::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_object_becomes_plain_map_in_json() {
        let obj = Value::Object {
            class: "Point".into(),
            fields: BTreeMap::from([("x".to_string(), Value::Int(1))]),
        };
        let json: serde_json::Value = obj.into();
        assert_eq!(json, serde_json::json!({ "x": 1 }));
    }
}
