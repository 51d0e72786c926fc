use super::ParamValue;
use crate::expr::{Scope, Value};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// One concrete assignment of a value to every tunable parameter.
///
/// Parameter names are shared between all configurations of a space, so a
/// configuration is a name table pointer plus a value vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    names: Arc<[String]>,
    values: Vec<ParamValue>,
}

impl Configuration {
    pub fn new(names: Arc<[String]>, values: Vec<ParamValue>) -> Self {
        debug_assert_eq!(names.len(), values.len());
        Self { names, values }
    }

    /// Convenience constructor, mostly for tests and examples.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<ParamValue>,
    {
        let (names, values): (Vec<String>, Vec<ParamValue>) = pairs
            .into_iter()
            .map(|(n, v)| (n.into(), v.into()))
            .unzip();
        Self::new(names.into(), values)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[ParamValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.values[i])
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ParamValue::as_i64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Cache key: values in parameter order, comma separated. Strings are
    /// JSON-quoted so a comma inside a value, or a numeric-looking string,
    /// cannot collide with another configuration.
    pub fn key(&self) -> String {
        self.values
            .iter()
            .map(|v| match v {
                ParamValue::Str(s) => serde_json::Value::String(s.clone()).to_string(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Scope for Configuration {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).map(ParamValue::to_value)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        Ok(())
    }
}

impl Serialize for Configuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

struct ConfigurationVisitor;

impl<'de> Visitor<'de> for ConfigurationVisitor {
    type Value = Configuration;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map from parameter name to value")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Configuration, A::Error> {
        let mut names = Vec::new();
        let mut values = Vec::new();
        while let Some((name, value)) = access.next_entry::<String, ParamValue>()? {
            names.push(name);
            values.push(value);
        }
        Ok(Configuration::new(names.into(), values))
    }
}

impl<'de> Deserialize<'de> for Configuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(ConfigurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_and_display_follow_parameter_order() {
        let cfg = Configuration::from_pairs([
            ("block_size_x", ParamValue::from(128)),
            ("scale", ParamValue::from(1.0)),
            ("algo", ParamValue::from("tiled")),
        ]);
        assert_eq!(cfg.key(), r#"128,1.0,"tiled""#);
        assert_eq!(cfg.to_string(), "block_size_x=128, scale=1.0, algo=tiled");
        assert_eq!(cfg.get_i64("block_size_x"), Some(128));
        assert!(cfg.get("missing").is_none());
    }

    #[test]
    fn keys_distinguish_commas_and_value_types() {
        let a = Configuration::from_pairs([("a", "x"), ("b", "y,z")]);
        let b = Configuration::from_pairs([("a", "x,y"), ("b", "z")]);
        assert_ne!(a.key(), b.key());

        let text = Configuration::from_pairs([("n", ParamValue::from("1"))]);
        let int = Configuration::from_pairs([("n", ParamValue::from(1))]);
        let float = Configuration::from_pairs([("n", ParamValue::from(1.0))]);
        assert_ne!(text.key(), int.key());
        assert_ne!(int.key(), float.key());
        assert_ne!(text.key(), float.key());

        let quoted = Configuration::from_pairs([("s", "a\",\"b")]);
        let split = Configuration::from_pairs([("s", "a"), ("t", "b")]);
        assert_ne!(quoted.key(), split.key());
    }

    #[test]
    fn serde_preserves_order() {
        let cfg = Configuration::from_pairs([("z", 1), ("a", 2), ("m", 3)]);
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(json, r#"{"z":1,"a":2,"m":3}"#);
        let back: Configuration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.names(), &["z", "a", "m"]);
    }
}
