//! Declared configuration options of one hosted object.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::error::ConfigError;
use crate::Value;

/// Option values keyed by name.
///
/// Only declared options exist; setting an unknown one is an error. A value
/// must match the kind of the option's current value (an option holding
/// `null` accepts anything). Strings are parsed into the option's kind, so
/// location query parameters can configure numeric options.
#[derive(Debug, Default)]
pub struct ConfigStore {
    values: RwLock<BTreeMap<String, Value>>,
}

impl ConfigStore {
    pub fn new(defaults: BTreeMap<String, Value>) -> Self {
        Self {
            values: RwLock::new(defaults),
        }
    }

    pub fn get(&self, key: &str) -> Result<Value, ConfigError> {
        self.values
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))
    }

    /// Typed read.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.get(key)?;
        let got = value.kind();
        value.deserialize_into().map_err(|_| ConfigError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
            got,
        })
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut values = self.values.write();
        let current = values
            .get(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let checked = conform(key, current, value)?;
        values.insert(key.to_string(), checked);
        Ok(())
    }

    /// Set several options. Nothing changes unless all of them are valid.
    pub fn update(&self, changes: BTreeMap<String, Value>) -> Result<(), ConfigError> {
        let mut values = self.values.write();
        let mut checked = Vec::with_capacity(changes.len());
        for (key, value) in changes {
            let current = values
                .get(&key)
                .ok_or_else(|| ConfigError::UnknownKey(key.clone()))?;
            let value = conform(&key, current, value)?;
            checked.push((key, value));
        }
        values.extend(checked);
        Ok(())
    }

    /// Apply string-valued settings, such as a location's query.
    pub fn apply_strings(&self, settings: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        self.update(
            settings
                .iter()
                .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
                .collect(),
        )
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values.read().clone()
    }
}

fn conform(key: &str, current: &Value, value: Value) -> Result<Value, ConfigError> {
    let mismatch = |got: &'static str| ConfigError::TypeMismatch {
        key: key.to_string(),
        expected: current.kind(),
        got,
    };

    match (current, value) {
        (Value::Null, value) => Ok(value),
        (Value::Float(_), Value::Int(i)) => Ok(Value::Float(i as f64)),
        (Value::Str(_), value @ Value::Str(_)) => Ok(value),
        (_, Value::Str(text)) => parse_as(current, &text).ok_or_else(|| mismatch("str")),
        (current, value) if current.kind() == value.kind() => Ok(value),
        (_, value) => Err(mismatch(value.kind())),
    }
}

fn parse_as(current: &Value, text: &str) -> Option<Value> {
    let text = text.trim();
    match current {
        Value::Bool(_) => match text.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "off" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        Value::Int(_) => text.parse().ok().map(Value::Int),
        Value::Float(_) => text.parse().ok().map(Value::Float),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConfigStore {
        ConfigStore::new(BTreeMap::from([
            ("binning".to_string(), Value::Int(1)),
            ("cooling".to_string(), Value::Bool(false)),
            ("setpoint".to_string(), Value::Float(-10.0)),
            ("device".to_string(), Value::Str("/dev/ttyS0".into())),
            ("extra".to_string(), Value::Null),
        ]))
    }

    #[test]
    fn test_unknown_key() {
        let store = store();
        assert_eq!(store.get("gain"), Err(ConfigError::UnknownKey("gain".into())));
        assert!(store.set("gain", Value::Int(1)).is_err());
        assert!(!store.contains("gain"));
    }

    #[test]
    fn test_type_mismatch() {
        let err = store().set("binning", Value::Bool(true)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::TypeMismatch {
                key: "binning".into(),
                expected: "int",
                got: "bool"
            }
        );
    }

    #[test]
    fn test_int_widens_to_float() {
        let store = store();
        store.set("setpoint", Value::Int(-20)).unwrap();
        assert_eq!(store.get("setpoint").unwrap(), Value::Float(-20.0));
    }

    #[test]
    fn test_strings_are_parsed() {
        let store = store();
        store
            .apply_strings(&BTreeMap::from([
                ("binning".to_string(), "2".to_string()),
                ("cooling".to_string(), "on".to_string()),
            ]))
            .unwrap();
        assert_eq!(store.get_as::<i64>("binning").unwrap(), 2);
        assert!(store.get_as::<bool>("cooling").unwrap());

        assert!(store.set("binning", Value::Str("two".into())).is_err());
    }

    #[test]
    fn test_update_is_all_or_nothing() {
        let store = store();
        let result = store.update(BTreeMap::from([
            ("binning".to_string(), Value::Int(4)),
            ("cooling".to_string(), Value::Int(1)),
        ]));
        assert!(result.is_err());
        assert_eq!(store.get("binning").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_null_default_accepts_anything() {
        let store = store();
        store.set("extra", Value::List(vec![Value::Int(1)])).unwrap();
        assert_eq!(store.keys().len(), 5);
    }
}
