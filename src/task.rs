//! Task declarations and the instances a chain is made of.

use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::config::ConfigNode;
use crate::data::HandlerKind;
use crate::execute::{RunContext, RunOutput};
use crate::param::{ParamSpec, ParameterSet};
use crate::value::{ReturnKind, TaskValue};

/// The run function of a task. It receives a [`RunContext`] giving access to
/// bound parameters and the values of input tasks, and returns the declared
/// output.
pub type RunFn = Arc<dyn Fn(&mut RunContext) -> anyhow::Result<RunOutput> + Send + Sync>;

/// How an input task reference is matched against the chain.
#[derive(Debug, Clone)]
pub enum InputRef {
    /// A task name: bare, `group:name` or `namespace::group:name`. A `~~`
    /// prefix disables namespace scoping during the search.
    Name(String),
    /// A regular expression over full names. Every match is linked and the
    /// receiving task sees an ordered collection.
    Regex(String),
}

/// Declaration of one input task reference.
#[derive(Debug, Clone)]
pub struct InputSpec {
    reference: InputRef,
    alias: Option<String>,
    default: Option<Value>,
    as_object: bool,
}

impl InputSpec {
    /// Reference a task by name.
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: InputRef::Name(reference.into()),
            alias: None,
            default: None,
            as_object: false,
        }
    }

    /// Reference every task whose full name matches a regular expression.
    pub fn matching(pattern: impl Into<String>) -> Self {
        Self {
            reference: InputRef::Regex(pattern.into()),
            alias: None,
            default: None,
            as_object: false,
        }
    }

    /// Name under which the run function sees this input. Defaults to the
    /// reference itself.
    pub fn named(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Make the input optional: when the referenced task is absent from the
    /// chain, the run function receives this value instead.
    pub fn optional(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Hand the run function the task instance itself instead of its value.
    /// The input is then not evaluated eagerly.
    pub fn as_object(mut self) -> Self {
        self.as_object = true;
        self
    }

    pub(crate) fn reference(&self) -> &InputRef {
        &self.reference
    }

    pub(crate) fn declared_name(&self) -> &str {
        match &self.alias {
            Some(alias) => alias,
            None => match &self.reference {
                InputRef::Name(name) => name,
                InputRef::Regex(pattern) => pattern,
            },
        }
    }

    pub(crate) fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub(crate) fn is_object(&self) -> bool {
        self.as_object
    }
}

/// Declarative description of a task: its registry key, inputs, parameters,
/// return kind and run function.
///
/// Specs are registered in a [`Registry`](crate::Registry) under their dotted
/// key and selected from configs with `tasks:` entries, where a trailing `.*`
/// matches every concrete spec under the prefix.
#[derive(Clone)]
pub struct TaskSpec {
    key: String,
    name: String,
    group: String,
    is_abstract: bool,
    params: Vec<ParamSpec>,
    inputs: Vec<InputSpec>,
    returns: ReturnKind,
    handler: Option<HandlerKind>,
    run: RunFn,
}

impl TaskSpec {
    /// Declare a task under a dotted registry key. The task name derives from
    /// the key's last segment (`features.FilteredDataTask` becomes
    /// `filtered_data`) unless overridden with [`named`](TaskSpec::named).
    pub fn new<F>(key: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut RunContext) -> anyhow::Result<RunOutput> + Send + Sync + 'static,
    {
        let key = key.into();
        let name = derive_name(key.rsplit('.').next().unwrap_or(&key));
        Self {
            key,
            name,
            group: String::new(),
            is_abstract: false,
            params: Vec::new(),
            inputs: Vec::new(),
            returns: ReturnKind::Value,
            handler: None,
            run: Arc::new(run),
        }
    }

    /// Override the derived task name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Assign the task to a group. Groups organize the persistence layout
    /// and may nest with `:` (`preprocessing:images`).
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Mark the spec abstract. Abstract specs are skipped by wildcard
    /// selection and rejected when selected by exact key.
    pub fn abstract_task(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Declare a parameter.
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Declare an input task reference.
    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    /// Declare the return kind. The data handler derives from it unless
    /// overridden with [`with_handler`](TaskSpec::with_handler).
    pub fn returns(mut self, kind: ReturnKind) -> Self {
        self.returns = kind;
        self
    }

    /// Override the derived data handler, e.g. [`HandlerKind::Memory`] to
    /// skip persistence or [`HandlerKind::Continuable`] for resumable runs.
    pub fn with_handler(mut self, handler: HandlerKind) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub(crate) fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub(crate) fn inputs(&self) -> &[InputSpec] {
        &self.inputs
    }

    pub fn return_kind(&self) -> ReturnKind {
        self.returns
    }

    pub(crate) fn run_fn(&self) -> &RunFn {
        &self.run
    }

    /// Handler chosen from the declared return kind, or the explicit
    /// override.
    pub fn handler(&self) -> HandlerKind {
        match self.handler {
            Some(handler) => handler,
            None => match self.returns {
                ReturnKind::Stream => HandlerKind::Stream,
                ReturnKind::Directory => HandlerKind::Directory,
                _ => HandlerKind::File,
            },
        }
    }

    /// Name with group, `<group>:<name>`.
    pub fn slugname(&self) -> String {
        if self.group.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.group, self.name)
        }
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("group", &self.group)
            .field("returns", &self.returns)
            .finish()
    }
}

/// Derive a task name from a type-like key segment: camel case becomes snake
/// case and a trailing `Task` suffix is stripped.
pub(crate) fn derive_name(segment: &str) -> String {
    let mut name = String::with_capacity(segment.len() + 4);
    for (i, c) in segment.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            name.push('_');
        }
        name.push(c.to_ascii_lowercase());
    }
    match name.strip_suffix("_task") {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

/// One linked input entry of a task instance.
pub(crate) struct InputEntry {
    pub declared: String,
    /// Resolved full names and weak handles into the owning chain. A plain
    /// reference resolves to exactly one task, a regex to any number.
    pub resolved: Vec<(String, Weak<TaskInstance>)>,
    pub as_object: bool,
    pub default: Option<Value>,
}

pub(crate) struct EvalState {
    pub value: Option<Arc<TaskValue>>,
    pub forced: bool,
}

/// One task of a chain: a [`TaskSpec`] paired with its owning config node,
/// bound parameters and linked inputs.
///
/// Instances are shared (`Arc`), a [`MultiChain`](crate::MultiChain) may hand
/// the same instance to several chains when their fingerprints agree.
pub struct TaskInstance {
    spec: Arc<TaskSpec>,
    config: Arc<ConfigNode>,
    base_dir: Utf8PathBuf,
    fullname: String,
    params: ParameterSet,
    parameter_mode: bool,
    context_name: Option<String>,
    pub(crate) inputs: RwLock<Vec<InputEntry>>,
    pub(crate) fingerprint: OnceLock<String>,
    pub(crate) state: Mutex<EvalState>,
}

impl TaskInstance {
    pub(crate) fn new(
        spec: Arc<TaskSpec>,
        config: Arc<ConfigNode>,
        base_dir: Utf8PathBuf,
        params: ParameterSet,
        parameter_mode: bool,
        context_name: Option<String>,
    ) -> Self {
        let fullname = match config.namespace() {
            Some(ns) => format!("{ns}::{}", spec.slugname()),
            None => spec.slugname(),
        };
        Self {
            spec,
            config,
            base_dir,
            fullname,
            params,
            parameter_mode,
            context_name,
            inputs: RwLock::new(Vec::new()),
            fingerprint: OnceLock::new(),
            state: Mutex::new(EvalState {
                value: None,
                forced: false,
            }),
        }
    }

    pub fn spec(&self) -> &Arc<TaskSpec> {
        &self.spec
    }

    pub fn config(&self) -> &Arc<ConfigNode> {
        &self.config
    }

    pub fn namespace(&self) -> Option<&str> {
        self.config.namespace()
    }

    /// Name with group, without namespace.
    pub fn slugname(&self) -> String {
        self.spec.slugname()
    }

    /// Unique name within the chain, `<namespace>::<group>:<name>` with
    /// missing components collapsed.
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn group(&self) -> &str {
        self.spec.group()
    }

    /// Bound parameters of this instance.
    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub(crate) fn parameter_mode(&self) -> bool {
        self.parameter_mode
    }

    pub(crate) fn context_name(&self) -> Option<&str> {
        self.context_name.as_deref()
    }

    /// Directory holding every artifact of this task,
    /// `<base>/<group-path>/<name>`.
    pub fn dir(&self) -> Utf8PathBuf {
        let mut path = self.base_dir.clone();
        for part in self.spec.group().split(':').filter(|s| !s.is_empty()) {
            path.push(part);
        }
        path.push(self.spec.name());
        path
    }

    /// Whether this instance is marked for recomputation.
    pub fn is_forced(&self) -> bool {
        self.state.lock().unwrap().forced
    }

    /// Mark this instance for recomputation. The next `value()` call ignores
    /// persisted data and runs the task again. With `delete_data` the
    /// persisted artifact is removed immediately.
    ///
    /// Forcing a single task leaves downstream artifacts untouched, prefer
    /// [`Chain::force`](crate::Chain::force) to invalidate dependents too.
    ///
    /// Returns `&self` so that `task.force(false)?.value()` chains.
    pub fn force(&self, delete_data: bool) -> Result<&Self, crate::EvalError> {
        if !delete_data {
            tracing::warn!(
                task = %self.fullname(),
                "forced without delete_data, stale downstream artifacts stay valid"
            );
        }
        self.force_mark(delete_data)?;
        Ok(self)
    }

    pub(crate) fn input_entries(&self) -> std::sync::RwLockReadGuard<'_, Vec<InputEntry>> {
        self.inputs.read().unwrap()
    }

    pub(crate) fn base_dir(&self) -> &Utf8Path {
        &self.base_dir
    }
}

impl std::fmt::Debug for TaskInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<task: {}>", self.fullname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_name() {
        assert_eq!(derive_name("FilteredDataTask"), "filtered_data");
        assert_eq!(derive_name("ThisIsSomething"), "this_is_something");
        assert_eq!(derive_name("already_snake"), "already_snake");
        assert_eq!(derive_name("X"), "x");
    }

    #[test]
    fn test_slugname_with_group() {
        let spec = TaskSpec::new("movies.AllMoviesTask", |_| {
            Ok(RunOutput::Value(Value::Null))
        })
        .in_group("movies");
        assert_eq!(spec.slugname(), "movies:all_movies");
    }

    #[test]
    fn test_handler_from_return_kind() {
        let spec = TaskSpec::new("a.B", |_| Ok(RunOutput::Value(Value::Null)));
        assert_eq!(spec.handler(), HandlerKind::File);
        let spec = spec.returns(ReturnKind::Stream);
        assert_eq!(spec.handler(), HandlerKind::Stream);
        let spec = spec.with_handler(HandlerKind::Memory);
        assert_eq!(spec.handler(), HandlerKind::Memory);
    }
}
