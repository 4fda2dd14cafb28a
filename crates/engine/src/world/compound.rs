//! Persisted entity records.
//!
//! A [`Compound`] is an open key-value map of NBT values. Foreign-entity
//! records carry their constructor key under [`Compound::TYPE_KEY`]; native
//! records are whatever their tile entity writes.

use std::collections::HashMap;

use fastnbt::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Compound(HashMap<String, Value>);

impl Compound {
    /// Key of the type discriminator in foreign-entity records.
    pub const TYPE_KEY: &'static str = "type";

    pub fn new() -> Self {
        Self::default()
    }

    /// A record whose discriminator is `kind`.
    pub fn with_type(kind: &str) -> Self {
        let mut compound = Self::new();
        compound.put_str(Self::TYPE_KEY, kind);
        compound
    }

    pub fn kind(&self) -> Option<&str> {
        self.get_str(Self::TYPE_KEY)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.0.get(key)? {
            Value::Byte(v) => Some(*v as i32),
            Value::Short(v) => Some(*v as i32),
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Long(v) => Some(*v),
            _ => self.get_i32(key).map(i64::from),
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_compound(&self, key: &str) -> Option<Compound> {
        match self.0.get(key)? {
            Value::Compound(map) => Some(Compound(map.clone())),
            _ => None,
        }
    }

    pub fn put_i32(&mut self, key: impl Into<String>, value: i32) {
        self.put(key, Value::Int(value));
    }

    pub fn put_i64(&mut self, key: impl Into<String>, value: i64) {
        self.put(key, Value::Long(value));
    }

    pub fn put_f64(&mut self, key: impl Into<String>, value: f64) {
        self.put(key, Value::Double(value));
    }

    pub fn put_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.put(key, Value::String(value.into()));
    }

    pub fn put_compound(&mut self, key: impl Into<String>, value: Compound) {
        self.put(key, Value::Compound(value.0));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, fastnbt::error::Error> {
        fastnbt::to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, fastnbt::error::Error> {
        fastnbt::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let mut c = Compound::with_type("chest");
        c.put_i64("energy", 1_500);
        c.put_f64("speed", 0.25);
        assert_eq!(c.kind(), Some("chest"));
        assert_eq!(c.get_i64("energy"), Some(1_500));
        assert_eq!(c.get_f64("speed"), Some(0.25));
        assert_eq!(c.get_i32("energy"), None);
        assert_eq!(c.get_str("missing"), None);
    }

    #[test]
    fn nbt_bytes_roundtrip() {
        let mut inner = Compound::new();
        inner.put_str("fluid", "water");
        let mut c = Compound::new();
        c.put_i32("level", 3);
        c.put_compound("tank", inner.clone());

        let bytes = c.to_bytes().unwrap();
        let back = Compound::from_bytes(&bytes).unwrap();
        assert_eq!(back, c);
        assert_eq!(back.get_compound("tank"), Some(inner));
    }
}
