//! Data model of object streams.

use crate::error::{CodecError, CodecResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Definition of a class: its name, a version and the fields its objects
/// may carry.
///
/// The serialized form of a definition (its "class bytes") is what a
/// remote endpoint hands out when asked for a class it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub version: u32,
    pub fields: Vec<String>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>, version: u32, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            version,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn declares(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    /// Serialize the definition for transfer to another endpoint.
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let def: ClassDef = rmp_serde::from_slice(bytes)?;
        if def.name.is_empty() {
            return Err(CodecError::Malformed("class definition without a name".into()));
        }
        Ok(def)
    }
}

/// An instance of a class.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub class: String,
    pub fields: BTreeMap<String, Value>,
}

impl Object {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// A node of an object graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Object(Object),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Object> for Value {
    fn from(v: Object) -> Self {
        Value::Object(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_bytes_roundtrip() {
        let def = ClassDef::new("geometry.Point", 2, &["x", "y"]);
        let bytes = def.to_bytes().unwrap();
        assert_eq!(ClassDef::from_bytes(&bytes).unwrap(), def);
    }

    #[test]
    fn test_class_bytes_garbage_rejected() {
        assert!(ClassDef::from_bytes(&[0xc1, 0x00, 0x13]).is_err());
    }

    #[test]
    fn test_object_builder() {
        let point = Object::new("geometry.Point").with("x", 3i64).with("y", 4i64);
        assert_eq!(point.get("x").and_then(Value::as_int), Some(3));
        assert!(point.get("z").is_none());
    }
}
