//! JSON-compatible values, declared return kinds and their canonical
//! fingerprint representation.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::data::{DirHandle, StreamHandle};
use crate::param::ParameterObject;

/// The declared shape of a task's return value.
///
/// The data handler for a task is derived from this kind unless the task spec
/// carries an explicit [`HandlerKind`](crate::data::HandlerKind) override.
/// Scalar and collection kinds persist as a single JSON artifact, `Stream`
/// persists as JSON lines, `Directory` hands the task a directory to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Bool,
    Int,
    Float,
    Str,
    /// Any JSON array. Parametrized element hints are not checked.
    Seq,
    /// Any JSON mapping. Parametrized key/value hints are not checked.
    Map,
    /// Any JSON value at all.
    Value,
    /// A lazy sequence of JSON values, persisted as JSON lines.
    Stream,
    /// A directory populated by the task itself.
    Directory,
}

impl ReturnKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ReturnKind::Bool => "bool",
            ReturnKind::Int => "int",
            ReturnKind::Float => "float",
            ReturnKind::Str => "str",
            ReturnKind::Seq => "sequence",
            ReturnKind::Map => "mapping",
            ReturnKind::Value => "value",
            ReturnKind::Stream => "stream",
            ReturnKind::Directory => "directory",
        }
    }

    /// Lenient match of a concrete JSON value against this kind. Compound
    /// kinds check the outer shape only, `Float` accepts any number.
    pub(crate) fn accepts(self, value: &Value) -> bool {
        match self {
            ReturnKind::Bool => value.is_boolean(),
            ReturnKind::Int => value.is_i64() || value.is_u64(),
            ReturnKind::Float => value.is_number(),
            ReturnKind::Str => value.is_string(),
            ReturnKind::Seq => value.is_array(),
            ReturnKind::Map => value.is_object(),
            ReturnKind::Value => true,
            ReturnKind::Stream | ReturnKind::Directory => false,
        }
    }
}

/// The computed result of a task, as seen by downstream tasks.
///
/// Values are shared, a chain caches one `Arc<TaskValue>` per instance and
/// every consumer receives a clone of that handle.
#[derive(Debug, Clone)]
pub enum TaskValue {
    /// A plain JSON value.
    Json(Arc<Value>),
    /// A handle to a directory-backed artifact.
    Dir(DirHandle),
    /// A handle to a JSON-lines artifact, iterated lazily.
    Stream(StreamHandle),
}

impl TaskValue {
    /// Borrow the JSON payload, if this value is one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            TaskValue::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Borrow the directory handle, if this value is one.
    pub fn as_dir(&self) -> Option<&DirHandle> {
        match self {
            TaskValue::Dir(handle) => Some(handle),
            _ => None,
        }
    }

    /// Borrow the stream handle, if this value is one.
    pub fn as_stream(&self) -> Option<&StreamHandle> {
        match self {
            TaskValue::Stream(handle) => Some(handle),
            _ => None,
        }
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// A parameter value after binding, carrying the coerced form used by run
/// functions together with enough identity for fingerprinting.
#[derive(Clone)]
pub enum ParamValue {
    Json(Value),
    Path(camino::Utf8PathBuf),
    Object(Arc<dyn ParameterObject>),
}

impl ParamValue {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ParamValue::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&camino::Utf8Path> {
        match self {
            ParamValue::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<dyn ParameterObject>> {
        match self {
            ParamValue::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Canonical textual identity of this value, the form that enters the
    /// fingerprint. Scalars use their JSON form (strings quoted), sequences
    /// and mappings recurse with sorted keys, objects use their declared
    /// representation.
    pub fn canonical_repr(&self) -> String {
        match self {
            ParamValue::Json(value) => canonical_json(value),
            ParamValue::Path(path) => format!("{:?}", path.as_str()),
            ParamValue::Object(object) => object.repr(),
        }
    }
}

impl fmt::Debug for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_repr())
    }
}

/// Deterministic textual form of a JSON value, mapping keys sorted.
pub(crate) fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::Array(items) => {
            let inner: Vec<_> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let inner: Vec<_> = keys
                .into_iter()
                .map(|k| format!("{k:?}: {}", canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lenient_kinds() {
        assert!(ReturnKind::Map.accepts(&json!({"a": 1})));
        assert!(ReturnKind::Seq.accepts(&json!([1, 2])));
        assert!(ReturnKind::Float.accepts(&json!(1)));
        assert!(ReturnKind::Value.accepts(&json!(null)));
        assert!(!ReturnKind::Int.accepts(&json!(1.5)));
        assert!(!ReturnKind::Str.accepts(&json!(5)));
    }

    #[test]
    fn test_canonical_sorts_keys() {
        let a = json!({"b": 2, "a": [1, "x"]});
        assert_eq!(canonical_json(&a), r#"{"a": [1, "x"], "b": 2}"#);
    }

    #[test]
    fn test_canonical_distinguishes_str_from_number() {
        assert_ne!(canonical_json(&json!("5")), canonical_json(&json!(5)));
    }
}
