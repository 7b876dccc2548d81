//! Dynamic Document Values
//!
//! Documents are maps from column name to [`Value`]. The set of shapes is
//! deliberately small: it is what the storage layer can compute column
//! statistics over and what the bloom filters can key on. Nested structure
//! lives inside the document JSON; statistics and pushdown apply to top-level
//! columns only.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Uuid(Uuid),
}

// Bloom key type tags. Must stay stable: they are baked into on-disk blooms.
const KEY_BOOL: u8 = 0x01;
const KEY_INT: u8 = 0x02;
const KEY_FLOAT: u8 = 0x03;
const KEY_STR: u8 = 0x04;
const KEY_UUID: u8 = 0x05;

impl Value {
    /// Canonical bytes hashed into per-column bloom filters. `Null` has no
    /// key: it is never inserted and an equality predicate against `Null`
    /// never takes the bloom path.
    pub fn bloom_key(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(vec![KEY_BOOL, *b as u8]),
            Value::Int(i) => {
                let mut v = Vec::with_capacity(9);
                v.push(KEY_INT);
                v.extend_from_slice(&i.to_be_bytes());
                Some(v)
            }
            Value::Float(f) => {
                let mut v = Vec::with_capacity(9);
                v.push(KEY_FLOAT);
                v.extend_from_slice(&f.to_be_bytes());
                Some(v)
            }
            Value::Str(s) => {
                let mut v = Vec::with_capacity(1 + s.len());
                v.push(KEY_STR);
                v.extend_from_slice(s.as_bytes());
                Some(v)
            }
            Value::Uuid(u) => {
                let mut v = Vec::with_capacity(17);
                v.push(KEY_UUID);
                v.extend_from_slice(u.as_bytes());
                Some(v)
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Total order within a primitive class, `None` across classes. Drives
    /// min/max statistics and range predicates; cross-class comparisons never
    /// prune.
    pub fn compare_same_class(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}
