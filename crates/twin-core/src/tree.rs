use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Semi-structured payload reported by the agent.
///
/// Maps use `BTreeMap` so iteration (and therefore serialization) order is
/// stable regardless of the order keys arrived in.
#[derive(Clone, Debug, Default)]
pub enum Tree {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Tree>),
    Map(BTreeMap<String, Tree>),
}

impl Tree {
    pub fn from_json(v: Value) -> Self {
        match v {
            Value::Null => Tree::Null,
            Value::Bool(b) => Tree::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Tree::Int(i),
                None => Tree::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Tree::Str(s),
            Value::Array(items) => Tree::List(items.into_iter().map(Tree::from_json).collect()),
            Value::Object(map) => Tree::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Tree::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Tree::Null => Value::Null,
            Tree::Bool(b) => Value::Bool(*b),
            Tree::Int(i) => Value::from(*i),
            Tree::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Tree::Str(s) => Value::String(s.clone()),
            Tree::List(items) => Value::Array(items.iter().map(Tree::to_json).collect()),
            Tree::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn parse(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Value>(s).map(Tree::from_json)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Tree::Null => "null",
            Tree::Bool(_) => "bool",
            Tree::Int(_) => "integer",
            Tree::Float(_) => "number",
            Tree::Str(_) => "string",
            Tree::List(_) => "list",
            Tree::Map(_) => "map",
        }
    }

    pub fn get(&self, key: &str) -> Option<&Tree> {
        match self {
            Tree::Map(map) => map.get(key).filter(|v| !v.is_null()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Tree::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Tree::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Tree::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integers, and floats with no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Tree::Int(i) => Some(*i),
            Tree::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Tree::Int(i) => Some(*i as f64),
            Tree::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Tree]> {
        match self {
            Tree::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Tree>> {
        match self {
            Tree::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Scalar rendered as plain text (strings unquoted). Lists and maps yield `None`.
    pub fn scalar_text(&self) -> Option<String> {
        match self {
            Tree::Str(s) => Some(s.clone()),
            Tree::Bool(b) => Some(b.to_string()),
            Tree::Null | Tree::List(_) | Tree::Map(_) => None,
            Tree::Int(_) | Tree::Float(_) => Some(crate::hashing::canonical_string(self)),
        }
    }
}

impl PartialEq for Tree {
    /// Structural equality; integers and integral floats compare equal.
    /// List order is significant here; use [`crate::equivalent`] for the
    /// order-insensitive comparison.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Tree::Null, Tree::Null) => true,
            (Tree::Bool(a), Tree::Bool(b)) => a == b,
            (Tree::Str(a), Tree::Str(b)) => a == b,
            (Tree::Int(_) | Tree::Float(_), Tree::Int(_) | Tree::Float(_)) => {
                match (self, other) {
                    (Tree::Int(a), Tree::Int(b)) => a == b,
                    _ => self.as_f64() == other.as_f64(),
                }
            }
            (Tree::List(a), Tree::List(b)) => a == b,
            (Tree::Map(a), Tree::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Value> for Tree {
    fn from(v: Value) -> Self {
        Tree::from_json(v)
    }
}

impl From<&str> for Tree {
    fn from(s: &str) -> Self {
        Tree::Str(s.to_string())
    }
}

impl From<i64> for Tree {
    fn from(i: i64) -> Self {
        Tree::Int(i)
    }
}

impl Serialize for Tree {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Tree::Null => s.serialize_unit(),
            Tree::Bool(b) => s.serialize_bool(*b),
            Tree::Int(i) => s.serialize_i64(*i),
            Tree::Float(f) => s.serialize_f64(*f),
            Tree::Str(v) => s.serialize_str(v),
            Tree::List(items) => s.collect_seq(items),
            Tree::Map(map) => s.collect_map(map),
        }
    }
}

impl<'de> Deserialize<'de> for Tree {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Value::deserialize(d).map(Tree::from_json)
    }
}
