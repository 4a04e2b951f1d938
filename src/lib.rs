#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod chain;
mod config;
mod data;
mod error;
mod execute;
mod fingerprint;
mod lock;
mod multichain;
mod param;
mod registry;
mod task;
mod value;

pub use crate::chain::{Chain, TaskRow};
pub use crate::config::{
    Config, ConfigBuilder, ConfigNode, ConfigSource, ConfigValue, ContextSource, GlobalVars,
    RESERVED_PARAMETER_NAMES,
};
pub use crate::data::{
    DirHandle, Handler, HandlerKind, RunInfo, RunInfoConfig, RunInfoTask, StreamHandle, StreamIter,
};
pub use crate::error::{
    BindError, ChainError, ConfigError, ContextError, DataError, EvalError,
};
pub use crate::execute::{LogLevel, RunContext, RunOutput};
pub use crate::multichain::MultiChain;
pub use crate::param::{object_repr, ParamKind, ParamSpec, ParameterObject, ParameterSet};
pub use crate::registry::{ObjectFactory, Registry};
pub use crate::task::{InputRef, InputSpec, RunFn, TaskInstance, TaskSpec};
pub use crate::value::{ParamValue, ReturnKind, TaskValue};
