//! Context layers
//!
//! A [`Layer`] is an ordered set of context flags such as
//! `{device: "HHKB", thumbsense: true}`. It selects which remap tables are
//! active. Keys are unique and keep their insertion order.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Value of a single context flag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl LayerValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            LayerValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for LayerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerValue::Bool(b) => write!(f, "{b}"),
            LayerValue::Int(i) => write!(f, "{i}"),
            LayerValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for LayerValue {
    fn from(value: bool) -> Self {
        LayerValue::Bool(value)
    }
}

impl From<i64> for LayerValue {
    fn from(value: i64) -> Self {
        LayerValue::Int(value)
    }
}

impl From<&str> for LayerValue {
    fn from(value: &str) -> Self {
        LayerValue::Str(value.to_string())
    }
}

impl From<String> for LayerValue {
    fn from(value: String) -> Self {
        LayerValue::Str(value)
    }
}

impl std::str::FromStr for LayerValue {
    type Err = std::convert::Infallible;

    /// Parse a value typed on the command line: `true`/`false`, integers, else a string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "true" => LayerValue::Bool(true),
            "false" => LayerValue::Bool(false),
            _ => match s.parse::<i64>() {
                Ok(i) => LayerValue::Int(i),
                Err(_) => LayerValue::Str(s.to_string()),
            },
        })
    }
}

/// Ordered mapping of context key to value
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Layer {
    entries: Vec<(String, LayerValue)>,
}

impl Layer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<LayerValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut layer = Self::new();
        for (key, value) in pairs {
            layer.insert(key, value);
        }
        layer
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&LayerValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LayerValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Set a key. An existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<LayerValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<LayerValue> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Merge all keys of `other` into this layer.
    pub fn merge(&mut self, other: &Layer) {
        for (key, value) in other.iter() {
            self.insert(key, value.clone());
        }
    }

    /// Remove every key that `other` names, whatever its value.
    pub fn remove_keys(&mut self, other: &Layer) {
        for key in other.keys() {
            self.remove(key);
        }
    }

    /// Copy of this layer with one extra key set.
    pub fn with(&self, key: impl Into<String>, value: impl Into<LayerValue>) -> Layer {
        let mut layer = self.clone();
        layer.insert(key, value);
        layer
    }

    /// Same keys and values, ignoring order.
    pub fn same_context(&self, other: &Layer) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(key, value)| other.get(key) == Some(value))
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, "}}")
    }
}

impl Serialize for Layer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Layer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LayerVisitor;

        impl<'de> Visitor<'de> for LayerVisitor {
            type Value = Layer;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of context keys to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Layer, A::Error> {
                let mut layer = Layer::new();
                while let Some((key, value)) = access.next_entry::<String, LayerValue>()? {
                    layer.insert(key, value);
                }
                Ok(layer)
            }
        }

        deserializer.deserialize_map(LayerVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_existing_order() {
        let mut layer = Layer::from_pairs([("device", "HHKB")]);
        layer.insert("thumbsense", true);
        layer.merge(&Layer::from_pairs([("device", LayerValue::from("Other"))]));

        let keys: Vec<&str> = layer.keys().collect();
        assert_eq!(keys, vec!["device", "thumbsense"]);
        assert_eq!(layer.get("device"), Some(&LayerValue::from("Other")));
    }

    #[test]
    fn test_remove_keys_ignores_values() {
        let mut layer = Layer::from_pairs([("thumbsense", true)]);
        layer.insert("application", "Chrome");
        layer.remove_keys(&Layer::from_pairs([("thumbsense", false)]));
        assert_eq!(layer, Layer::from_pairs([("application", "Chrome")]));
    }

    #[test]
    fn test_same_context_is_order_insensitive() {
        let a = Layer::from_pairs([
            ("device", LayerValue::from("HHKB")),
            ("thumbsense", LayerValue::from(true)),
        ]);
        let b = Layer::from_pairs([
            ("thumbsense", LayerValue::from(true)),
            ("device", LayerValue::from("HHKB")),
        ]);
        assert_ne!(a, b);
        assert!(a.same_context(&b));
        assert!(!a.same_context(&Layer::from_pairs([("thumbsense", true)])));
    }

    #[test]
    fn test_json_shape_is_a_map() {
        let layer = Layer::from_pairs([
            ("thumbsense", LayerValue::from(true)),
            ("application", LayerValue::from("Chrome")),
        ]);
        let json = serde_json::to_string(&layer).unwrap();
        assert_eq!(json, r#"{"thumbsense":true,"application":"Chrome"}"#);

        let parsed: Layer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, layer);
    }

    #[test]
    fn test_value_from_command_line() {
        assert_eq!("true".parse::<LayerValue>().unwrap(), LayerValue::Bool(true));
        assert_eq!("42".parse::<LayerValue>().unwrap(), LayerValue::Int(42));
        assert_eq!(
            "Chrome".parse::<LayerValue>().unwrap(),
            LayerValue::Str("Chrome".to_string())
        );
    }
}
