//! Runtime values for the Quill VM and the bridge boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value manipulated by the VM.
///
/// The bridge boundary supports a subset of these: null, bool, int,
/// float, string, lists of the above, and handles. `Map` exists only
/// inside the VM; passing one across the bridge is a marshal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
    Handle(HandleRef),
}

/// Kind of host entity a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Chapter,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Chapter => write!(f, "chapter"),
        }
    }
}

/// An opaque, session-scoped reference to a host-owned entity.
///
/// `index` addresses a slot in a host arena; `generation` is the issuing
/// session's handle epoch. Terminating a session bumps its epoch, so a
/// stale handle can never resolve again, even if replayed through a later
/// session for the same extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleRef {
    pub kind: HandleKind,
    pub index: u32,
    pub generation: u32,
}

impl Value {
    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Handle(_) => "handle",
        }
    }

    /// Truthiness for conditional jumps and logic instructions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Handle(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::Str("x".to_string()).is_truthy());
        assert!(Value::List(vec![Value::Null]).is_truthy());
    }

    #[test]
    fn test_serde_round_trip() {
        let value = Value::List(vec![
            Value::Int(7),
            Value::Str("chapter".to_string()),
            Value::Handle(HandleRef {
                kind: HandleKind::Chapter,
                index: 2,
                generation: 9,
            }),
        ]);
        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
