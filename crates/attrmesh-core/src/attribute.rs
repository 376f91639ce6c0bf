//! Attribute values and attribute bags
//!
//! A request is described by a bag of named attributes. The dispatch core only
//! relies on the read contract (`Bag`) and, for attribute generation, on the
//! write contract of `MutableBag`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Declared type of an attribute or of a compiled expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    String,
    Int64,
    Double,
    Bool,
    Bytes,
    Duration,
    Timestamp,
    StringMap,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "STRING",
            ValueType::Int64 => "INT64",
            ValueType::Double => "DOUBLE",
            ValueType::Bool => "BOOL",
            ValueType::Bytes => "BYTES",
            ValueType::Duration => "DURATION",
            ValueType::Timestamp => "TIMESTAMP",
            ValueType::StringMap => "STRING_MAP",
        };
        f.write_str(name)
    }
}

/// A single attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int64(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Duration(Duration),
    Timestamp(DateTime<Utc>),
    StringMap(BTreeMap<String, String>),
}

impl Value {
    /// The declared type this value satisfies
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Int64(_) => ValueType::Int64,
            Value::Double(_) => ValueType::Double,
            Value::Bool(_) => ValueType::Bool,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Duration(_) => ValueType::Duration,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::StringMap(_) => ValueType::StringMap,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Bytes(b) => write!(f, "{:?}", b),
            Value::Duration(d) => write!(f, "{:?}", d),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::StringMap(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Duration> for Value {
    fn from(value: Duration) -> Self {
        Value::Duration(value)
    }
}

/// Read-only view over a set of attributes
pub trait Bag: Send + Sync {
    /// Get the value of an attribute, if present
    fn get(&self, name: &str) -> Option<Value>;

    /// Names of all attributes in the bag
    fn names(&self) -> Vec<String>;
}

/// An owned, writable attribute bag
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutableBag {
    values: BTreeMap<String, Value>,
}

impl MutableBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bag holding a copy of every attribute in `bag`
    pub fn from_bag(bag: &dyn Bag) -> Self {
        let mut out = Self::new();
        out.merge(bag);
        out
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn delete(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// Copy every attribute of `other` into this bag, overwriting existing names
    pub fn merge(&mut self, other: &dyn Bag) {
        for name in other.names() {
            if let Some(value) = other.get(&name) {
                self.values.insert(name, value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

impl Bag for MutableBag {
    fn get(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

impl<K, V> FromIterator<(K, V)> for MutableBag
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = MutableBag::new();
        for (k, v) in iter {
            bag.set(k, v);
        }
        bag
    }
}

impl fmt::Display for MutableBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---")?;
        for (name, value) in &self.values {
            writeln!(f, "{:<30}: {}", name, value)?;
        }
        Ok(())
    }
}
