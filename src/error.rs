use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced while loading a config description, before any chain
/// exists. Every variant carries enough context to point back at the
/// originating file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse config file '{path}'.\n{message}")]
    Parse { path: Utf8PathBuf, message: String },

    #[error("Config file '{0}' has an unknown extension, expected .yaml or .json")]
    UnknownExtension(Utf8PathBuf),

    #[error("Config '{config}' is missing a name, pass one explicitly for in-memory data")]
    MissingName { config: String },

    #[error("Unresolved placeholder '{{{token}}}' in config '{config}'")]
    UnresolvedPlaceholder { config: String, token: String },

    #[error("Cycle in `uses` references: {}", .0.join(" -> "))]
    UseCycle(Vec<String>),

    #[error("Part '{part}' not found in multi-part config '{config}'")]
    MissingPart { config: String, part: String },

    #[error("No part selected for multi-part config '{config}' and no part is marked `main_part`")]
    NoMainPart { config: String },

    #[error("More than one part of config '{config}' is marked `main_part`")]
    MultipleMainParts { config: String },

    #[error("Multi-part config '{config}' may only contain the `configs` key")]
    MalformedMultiPart { config: String },

    #[error("`{field}` of config '{config}' has to be a string or a list of strings")]
    MalformedField { config: String, field: String },

    #[error("Context overlay sets reserved key '{key}'")]
    ReservedKey { key: String },

    #[error("Malformed context overlay '{context}': {message}")]
    MalformedOverlay { context: String, message: String },

    #[error("Unknown parameter object class '{class}' in config '{config}'")]
    UnknownObjectClass { config: String, class: String },

    #[error("Malformed parameter object spec for key '{key}' in config '{config}': {message}")]
    BadObjectSpec {
        config: String,
        key: String,
        message: String,
    },

    #[error("Couldn't instantiate parameter object '{class}' in config '{config}'.\n{error}")]
    ObjectInit {
        config: String,
        class: String,
        error: anyhow::Error,
    },
}

/// Errors surfaced while binding one declared parameter against the config
/// tree.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("Value for required parameter '{param}' of task '{task}' not found in any reachable config")]
    Missing { task: String, param: String },

    #[error("Value `{value}` of parameter '{param}' of task '{task}' is not a valid {expected}")]
    Kind {
        task: String,
        param: String,
        expected: &'static str,
        value: String,
    },

    #[error("Parameter name '{0}' is reserved and may not be declared by a task")]
    Reserved(String),
}

/// Errors surfaced while assembling a chain from configs.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Task selector '{selector}' in config '{config}' matches nothing in the registry")]
    UnknownTask { config: String, selector: String },

    #[error("Task '{0}' is abstract and cannot be selected directly")]
    AbstractTask(String),

    #[error("Conflict of task name '{name}' between configs '{first}' and '{second}'")]
    TaskNameConflict {
        name: String,
        first: String,
        second: String,
    },

    #[error("Input task '{reference}' of task '{task}' not found")]
    UnknownReference { task: String, reference: String },

    #[error("Ambiguous task name '{name}'. Possible matches: {}", .candidates.join(", "))]
    AmbiguousReference {
        name: String,
        candidates: Vec<String>,
    },

    #[error("Multiple input tasks with same name '{name}' on task '{task}'")]
    DuplicateInput { task: String, name: String },

    #[error("Invalid input task regex '{pattern}' on task '{task}'.\n{source}")]
    BadInputRegex {
        task: String,
        pattern: String,
        source: regex::Error,
    },

    #[error("Chain is not acyclic, cycle found through task '{0}'")]
    Cycle(String),

    #[error("Task '{0}' not found in chain")]
    TaskNotFound(String),

    #[error("Multiple configs with same name '{0}' in multichain")]
    DuplicateChainName(String),

    #[error("All chains of a multichain have to agree on parameter mode")]
    ParameterModeMismatch,

    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("I/O error at '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't encode value for '{path}'.\n{source}")]
    Encode {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Couldn't decode artifact '{path}'.\n{source}")]
    Decode {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Couldn't write run info '{path}'.\n{source}")]
    RunInfo {
        path: Utf8PathBuf,
        source: serde_yaml::Error,
    },

    #[error("No artifact found at '{0}'")]
    NotFound(Utf8PathBuf),

    #[error("Task '{0}' does not persist data")]
    NotPersisting(String),

    #[error("Symbolic links are not supported on this platform")]
    SymlinkUnsupported,
}

/// Errors surfaced inside a run function while reading its context.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Parameter '{0}' not found")]
    ParamNotFound(String),

    #[error("Parameter '{name}' is not a {expected}")]
    ParamType { name: String, expected: &'static str },

    #[error("Input task '{0}' not found")]
    InputNotFound(String),

    #[error("Input '{0}' resolves to {1} tasks, read it as a collection")]
    InputNotSingle(String, usize),

    #[error("Input task '{0}' is linked as object, its value is not evaluated")]
    InputIsObject(String),

    #[error("Input '{0}' is not a {1}")]
    InputType(String, &'static str),

    #[error("The task has no working directory, its handler is not directory-backed")]
    NoWorkingDir,
}

/// Errors surfaced while evaluating a task's value.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Couldn't acquire lock for '{path}'.\n{source}")]
    Lock {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Task '{task}':\n{error}")]
    Run { task: String, error: anyhow::Error },

    #[error("Task '{task}' returned {got} instead of the declared {expected}")]
    ReturnType {
        task: String,
        expected: &'static str,
        got: String,
    },

    #[error("Input task '{input}' of task '{task}' is gone, its chain was dropped")]
    ChainDropped { task: String, input: String },
}
