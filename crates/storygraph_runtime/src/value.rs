// Socket and property values.
//
// Sockets are duck-typed: the `socket_type` tag on a socket is advisory
// (UI hinting only), so everything that can travel an edge is a `Value`.
// The Unresolved sentinel marks "no value produced yet" and is distinct
// from Null, which is a produced empty value.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::NodeError;
use crate::event::ScriptEvent;
use crate::graph::Graph;
use crate::run::FunctionWrapper;
use crate::scene::Scene;

/// Dynamic value carried by sockets, properties and state entries.
///
/// The `Function`, `Event`, `Module` and `Scene` variants are runtime-only
/// and serialize to their display form, mirroring how the persisted format
/// stringifies unknowns.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Unresolved,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Function(FunctionWrapper),
    Event(ScriptEvent),
    Module(Arc<Graph>),
    Scene(Scene),
}

impl Value {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Value::Unresolved)
    }

    /// A value counts as set when it is neither Unresolved nor Null,
    /// unless `none_is_set` widens that to "anything resolved".
    pub fn is_set(&self, none_is_set: bool) -> bool {
        if none_is_set {
            !self.is_unresolved()
        } else {
            !matches!(self, Value::Unresolved | Value::Null)
        }
    }

    /// Truthiness: Unresolved/Null are false, numbers compare against
    /// zero, strings and containers against emptiness.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Unresolved | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            Value::Function(_) | Value::Event(_) | Value::Module(_) | Value::Scene(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unresolved => "unresolved",
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Event(_) => "event",
            Value::Module(_) => "module",
            Value::Scene(_) => "scene",
        }
    }

    /// Render as a display string, used for string formatting nodes and
    /// for serializing runtime-only variants.
    pub fn to_display(&self) -> String {
        match self {
            Value::Unresolved => "<UNRESOLVED>".to_string(),
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::List(_) | Value::Dict(_) => {
                serde_json::to_string(&self.to_json()).unwrap_or_default()
            }
            Value::Function(f) => format!("<function {}>", f.endpoint_id()),
            Value::Event(e) => format!("<event {}>", e.event_type()),
            Value::Module(g) => format!("<module {}>", g.title),
            Value::Scene(s) => format!("<scene {}>", s.name()),
        }
    }

    /// Coerce to a declared type tag. Strings parse into numbers and
    /// bools ("true"/"yes"/"1", "false"/"no"/"0"); everything stringifies.
    pub fn coerce(&self, type_name: &str, node: &str, input: &str) -> Result<Value, NodeError> {
        let fail = |msg: &str| NodeError::input(node, input, msg);
        match type_name {
            "str" | "text" => Ok(Value::String(self.to_display())),
            "bool" => {
                if let Value::String(s) = self {
                    match s.to_lowercase().as_str() {
                        "true" | "yes" | "1" => Ok(Value::Bool(true)),
                        "false" | "no" | "0" => Ok(Value::Bool(false)),
                        _ => Ok(Value::Bool(!s.is_empty())),
                    }
                } else {
                    Ok(Value::Bool(self.as_bool()))
                }
            }
            "int" => match self {
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
                    .map(Value::Int)
                    .map_err(|_| fail("invalid integer")),
                _ => self.as_int().map(Value::Int).ok_or_else(|| fail("invalid integer")),
            },
            "float" | "number" => match self {
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| fail("invalid number")),
                _ => self.as_float().map(Value::Float).ok_or_else(|| fail("invalid number")),
            },
            _ => Ok(self.clone()),
        }
    }

    /// Convert from a persisted JSON property value. JSON null is the
    /// serialized form of Unresolved.
    pub fn from_json_property(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Unresolved,
            other => Value::from_json(other),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Unresolved | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Dict(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            // runtime-only values stringify, like unknowns in the
            // original persisted format
            other => serde_json::Value::String(other.to_display()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unresolved, Value::Unresolved) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Event(a), Value::Event(b)) => a.same_event(b),
            (Value::Module(a), Value::Module(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unresolved => write!(f, "<UNRESOLVED>"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(l) => f.debug_list().entries(l.iter()).finish(),
            Value::Dict(d) => f.debug_map().entries(d.iter()).finish(),
            other => write!(f, "{}", other.to_display()),
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
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(v: IndexMap<String, Value>) -> Self {
        Value::Dict(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_is_falsy_and_distinct_from_null() {
        assert!(!Value::Unresolved.as_bool());
        assert!(!Value::Null.as_bool());
        assert_ne!(Value::Unresolved, Value::Null);
        assert!(!Value::Null.is_set(false));
        assert!(Value::Null.is_set(true));
    }

    #[test]
    fn string_coercions() {
        let v = Value::String("42".to_string());
        assert_eq!(v.coerce("int", "n", "x").unwrap(), Value::Int(42));
        assert_eq!(
            Value::String("yes".to_string())
                .coerce("bool", "n", "x")
                .unwrap(),
            Value::Bool(true)
        );
        assert!(
            Value::String("forty".to_string())
                .coerce("int", "n", "x")
                .is_err()
        );
    }

    #[test]
    fn json_null_loads_as_unresolved_property() {
        let v = Value::from_json_property(&serde_json::Value::Null);
        assert!(v.is_unresolved());
        assert_eq!(v.to_json(), serde_json::Value::Null);
    }

    #[test]
    fn numeric_cross_equality() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
    }
}
