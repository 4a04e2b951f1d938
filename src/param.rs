//! Parameter declarations, binding and parameter objects.
//!
//! Tasks declare their parameters as [`ParamSpec`]s. At chain assembly the
//! binder resolves each declaration against the owning config node and every
//! node reachable through `uses` (breadth-first, nearest wins), coerces the
//! raw value to the declared kind and produces an immutable [`ParameterSet`].

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde_json::Value;

use crate::chain::Chain;
use crate::config::{ConfigNode, ConfigValue, RESERVED_PARAMETER_NAMES};
use crate::error::BindError;
use crate::value::{json_type_name, ParamValue};

/// The declared type of a parameter. Raw config values are coerced to it at
/// bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
    /// A filesystem path, coerced from a string.
    Path,
    /// Any JSON value, no coercion.
    #[default]
    Value,
    /// A parameter object instantiated from a `{class: …}` config entry.
    Object,
}

impl ParamKind {
    fn name(self) -> &'static str {
        match self {
            ParamKind::Bool => "bool",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Str => "str",
            ParamKind::Path => "path",
            ParamKind::Value => "value",
            ParamKind::Object => "parameter object",
        }
    }
}

/// Declaration of one task parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    name: String,
    kind: ParamKind,
    default: Option<Value>,
    name_in_config: Option<String>,
    ignore_persistence: bool,
    dont_persist_default_value: bool,
}

impl ParamSpec {
    /// Declare a required parameter of kind [`ParamKind::Value`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::default(),
            default: None,
            name_in_config: None,
            ignore_persistence: false,
            dont_persist_default_value: false,
        }
    }

    /// Set the declared kind.
    pub fn kind(mut self, kind: ParamKind) -> Self {
        self.kind = kind;
        self
    }

    /// Make the parameter optional with the given default.
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Look the parameter up under a different key than its name.
    pub fn name_in_config(mut self, name: impl Into<String>) -> Self {
        self.name_in_config = Some(name.into());
        self
    }

    /// Exclude this parameter from fingerprints entirely. Useful for knobs
    /// with no influence on the output, like verbosity.
    pub fn ignore_persistence(mut self) -> Self {
        self.ignore_persistence = true;
        self
    }

    /// Exclude this parameter from fingerprints while it equals its default.
    /// Useful for adding a parameter without invalidating existing data.
    pub fn dont_persist_default_value(mut self) -> Self {
        self.dont_persist_default_value = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config_key(&self) -> &str {
        self.name_in_config.as_deref().unwrap_or(&self.name)
    }
}

/// One parameter after binding.
pub(crate) struct BoundParam {
    spec: ParamSpec,
    value: ParamValue,
    raw: Value,
}

/// The bound parameters of one task instance, in declaration order.
pub struct ParameterSet {
    entries: Vec<BoundParam>,
}

impl ParameterSet {
    /// Bind every declaration against the owning config node.
    pub(crate) fn bind(
        task: &str,
        specs: &[ParamSpec],
        node: &ConfigNode,
    ) -> Result<Self, BindError> {
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            if RESERVED_PARAMETER_NAMES.contains(&spec.name.as_str()) {
                return Err(BindError::Reserved(spec.name.clone()));
            }
            let entry = match node.resolve(spec.config_key()) {
                Some(value) => bind_one(task, spec, value)?,
                None => {
                    let default = spec.default.clone().ok_or_else(|| BindError::Missing {
                        task: task.to_string(),
                        param: spec.name.clone(),
                    })?;
                    bind_one(task, spec, &ConfigValue::Json(default))?
                }
            };
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Get a bound value by declared name.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .find(|entry| entry.spec.name == name)
            .map(|entry| &entry.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.spec.name == name)
    }

    /// Declared names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.spec.name.as_str())
    }

    /// The `(name, canonical repr)` pairs entering the fingerprint, in
    /// declaration order. Skips ignored parameters and parameters equal to
    /// their default when declared `dont_persist_default_value`.
    pub(crate) fn persistence_entries(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|entry| !entry.spec.ignore_persistence)
            .filter(|entry| {
                !(entry.spec.dont_persist_default_value
                    && entry.spec.default.as_ref() == Some(&entry.raw))
            })
            .map(|entry| (entry.spec.name.clone(), entry.value.canonical_repr()))
            .collect()
    }

    /// Every parameter's repr, for run-info and logs.
    pub(crate) fn reprs(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|entry| (entry.spec.name.clone(), entry.value.canonical_repr()))
            .collect()
    }
}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for entry in &self.entries {
            map.entry(&entry.spec.name, &entry.value.canonical_repr());
        }
        map.finish()
    }
}

fn bind_one(task: &str, spec: &ParamSpec, value: &ConfigValue) -> Result<BoundParam, BindError> {
    let kind_error = |value: &dyn std::fmt::Debug| BindError::Kind {
        task: task.to_string(),
        param: spec.name.clone(),
        expected: spec.kind.name(),
        value: format!("{value:?}"),
    };

    let (value, raw) = match (spec.kind, value) {
        (ParamKind::Object, ConfigValue::Object(object)) => {
            (ParamValue::Object(object.clone()), Value::Null)
        }
        (_, ConfigValue::Object(object)) => return Err(kind_error(&object.repr())),
        (ParamKind::Object, ConfigValue::Json(json)) => return Err(kind_error(json)),
        (kind, ConfigValue::Json(json)) => {
            // `null` passes any declared kind, mirroring optional bindings.
            let ok = match (kind, json) {
                (_, Value::Null) => true,
                (ParamKind::Bool, v) => v.is_boolean(),
                (ParamKind::Int, v) => v.is_i64() || v.is_u64(),
                (ParamKind::Float, v) => v.is_number(),
                (ParamKind::Str, v) => v.is_string(),
                (ParamKind::Path, v) => v.is_string(),
                (ParamKind::Value, _) => true,
                (ParamKind::Object, _) => unreachable!(),
            };
            if !ok {
                return Err(kind_error(&format!(
                    "{} ({})",
                    json,
                    json_type_name(json)
                )));
            }
            let coerced = match (kind, json) {
                (ParamKind::Path, Value::String(path)) => {
                    ParamValue::Path(Utf8PathBuf::from(path.as_str()))
                }
                _ => ParamValue::Json(json.clone()),
            };
            (coerced, json.clone())
        }
    };

    Ok(BoundParam {
        spec: spec.clone(),
        value,
        raw,
    })
}

/// A user-defined value usable as a parameter.
///
/// The only hard requirement is a stable, unique string representation, it is
/// what enters fingerprints in place of the value itself. Objects that need
/// to consult the assembled chain may override [`init_chain`], it runs once
/// after assembly.
///
/// [`init_chain`]: ParameterObject::init_chain
pub trait ParameterObject: Send + Sync + 'static {
    /// Stable identity of this object, based on everything it was
    /// constructed from.
    fn repr(&self) -> String;

    /// Hook called once after the chain is assembled.
    fn init_chain(&self, _chain: &Chain) {}

    /// The concrete object, for downcasting in run functions. Implementations
    /// return `self`.
    fn as_any(&self) -> &dyn std::any::Any;
}

impl std::fmt::Debug for dyn ParameterObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repr())
    }
}

/// Build the conventional representation `Class(a=1, b="x")` from constructor
/// arguments, sorted by name. Arguments without influence on the output, and
/// arguments still at their default, should be left out by the caller, which
/// mirrors the per-parameter persistence flags at object level.
pub fn object_repr<'a>(
    class: &str,
    args: impl IntoIterator<Item = (&'a str, String)>,
) -> String {
    let mut args: Vec<_> = args.into_iter().collect();
    args.sort_by(|a, b| a.0.cmp(b.0));
    let inner: Vec<_> = args
        .into_iter()
        .map(|(name, repr)| format!("{name}={repr}"))
        .collect();
    format!("{class}({})", inner.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Scaler {
        factor: i64,
    }

    impl ParameterObject for Scaler {
        fn repr(&self) -> String {
            object_repr("Scaler", [("factor", self.factor.to_string())])
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn test_object_repr_sorted() {
        let repr = object_repr(
            "Model",
            [("beta", "2".to_string()), ("alpha", "1".to_string())],
        );
        assert_eq!(repr, "Model(alpha=1, beta=2)");
    }

    #[test]
    fn test_object_trait() {
        let scaler = Scaler { factor: 3 };
        assert_eq!(scaler.repr(), "Scaler(factor=3)");
    }

    #[test]
    fn test_bind_coercion() {
        let spec = ParamSpec::new("root").kind(ParamKind::Path);
        let bound = bind_one("t", &spec, &ConfigValue::Json(json!("/data/raw"))).unwrap();
        assert_eq!(bound.value.as_path().unwrap(), "/data/raw");

        let spec = ParamSpec::new("n").kind(ParamKind::Int);
        assert!(bind_one("t", &spec, &ConfigValue::Json(json!("five"))).is_err());
        assert!(bind_one("t", &spec, &ConfigValue::Json(json!(null))).is_ok());
    }

    #[test]
    fn test_persistence_entries_skip_flags() {
        let specs = vec![
            ParamSpec::new("x").kind(ParamKind::Int),
            ParamSpec::new("verbose")
                .kind(ParamKind::Bool)
                .default_value(json!(false))
                .ignore_persistence(),
            ParamSpec::new("new_knob")
                .default_value(json!(10))
                .dont_persist_default_value(),
        ];
        let entries: Vec<BoundParam> = specs
            .iter()
            .map(|spec| {
                let value = match spec.name() {
                    "x" => ConfigValue::Json(json!(5)),
                    "verbose" => ConfigValue::Json(json!(true)),
                    _ => ConfigValue::Json(json!(10)),
                };
                bind_one("t", spec, &value).unwrap()
            })
            .collect();
        let set = ParameterSet { entries };
        let persisted = set.persistence_entries();
        assert_eq!(persisted, vec![("x".to_string(), "5".to_string())]);
    }
}
