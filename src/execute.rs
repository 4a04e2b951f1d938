//! The execution engine.
//!
//! Evaluation is demand-driven: nothing runs until a task's `value()` is
//! requested. The engine then walks the DAG lazily, holding a per-artifact
//! advisory lock while it either loads the persisted result or invokes the
//! run function, validates the returned value against the declared kind,
//! persists it and writes the run-info sidecar.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::chain::{find_full_name, NamespaceMode};
use crate::data::{Handler, HandlerKind, RunInfo, RunInfoConfig, RunInfoTask, RunLog};
use crate::error::{ContextError, DataError, EvalError};
use crate::lock::ArtifactLock;
use crate::param::ParameterObject;
use crate::task::TaskInstance;
use crate::value::{ParamValue, TaskValue};

/// Console mirror level for task run logs. The log file itself always
/// receives every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

pub(crate) fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn console_enabled(level: LogLevel) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// What a run function hands back to the engine.
pub enum RunOutput {
    /// A JSON value matching the declared return kind.
    Value(Value),
    /// A lazy sequence, drained into the JSON-lines artifact while it is
    /// produced.
    Stream(Box<dyn Iterator<Item = Value> + Send>),
    /// The task populated its working directory, see [`RunContext::dir`].
    Dir,
}

impl RunOutput {
    /// Convenience wrapper for eager sequences.
    pub fn stream(values: Vec<Value>) -> Self {
        RunOutput::Stream(Box::new(values.into_iter()))
    }

    fn type_name(&self) -> &'static str {
        match self {
            RunOutput::Value(_) => "value",
            RunOutput::Stream(_) => "stream",
            RunOutput::Dir => "directory",
        }
    }
}

impl From<Value> for RunOutput {
    fn from(value: Value) -> Self {
        RunOutput::Value(value)
    }
}

/// One evaluated input as the run function sees it.
enum RunInput {
    /// The value of a single resolved task.
    Single {
        fullname: String,
        value: Arc<TaskValue>,
    },
    /// The task object itself, requested with `as_object`.
    Object {
        fullname: String,
        task: Arc<TaskInstance>,
    },
    /// Values of every task matched by a regex reference, ordered by name.
    Many {
        items: Vec<(String, Arc<TaskValue>)>,
    },
    /// The declared default of an optional input whose task is absent.
    Default { value: Arc<TaskValue> },
}

struct RunInputEntry {
    declared: String,
    input: RunInput,
}

/// Everything a run function may reach: bound parameters, evaluated input
/// values, the working directory for directory-backed handlers, the run log
/// and the user section of the run-info sidecar.
pub struct RunContext<'a> {
    task: String,
    params: &'a crate::param::ParameterSet,
    inputs: Vec<RunInputEntry>,
    working_dir: Option<Utf8PathBuf>,
    log: &'a mut RunLog,
    records: Vec<Value>,
}

impl RunContext<'_> {
    // -- parameters ---------------------------------------------------------

    /// A bound parameter by name.
    pub fn param(&self, name: &str) -> Result<&ParamValue, ContextError> {
        self.params
            .get(name)
            .ok_or_else(|| ContextError::ParamNotFound(name.to_string()))
    }

    pub fn param_bool(&self, name: &str) -> Result<bool, ContextError> {
        self.param_json(name)?
            .as_bool()
            .ok_or(ContextError::ParamType {
                name: name.to_string(),
                expected: "bool",
            })
    }

    pub fn param_int(&self, name: &str) -> Result<i64, ContextError> {
        self.param_json(name)?
            .as_i64()
            .ok_or(ContextError::ParamType {
                name: name.to_string(),
                expected: "int",
            })
    }

    pub fn param_float(&self, name: &str) -> Result<f64, ContextError> {
        self.param_json(name)?
            .as_f64()
            .ok_or(ContextError::ParamType {
                name: name.to_string(),
                expected: "float",
            })
    }

    pub fn param_str(&self, name: &str) -> Result<&str, ContextError> {
        self.param_json(name)?
            .as_str()
            .ok_or(ContextError::ParamType {
                name: name.to_string(),
                expected: "str",
            })
    }

    pub fn param_path(&self, name: &str) -> Result<&Utf8Path, ContextError> {
        self.param(name)?.as_path().ok_or(ContextError::ParamType {
            name: name.to_string(),
            expected: "path",
        })
    }

    /// The raw JSON of a parameter.
    pub fn param_json(&self, name: &str) -> Result<&Value, ContextError> {
        self.param(name)?.as_json().ok_or(ContextError::ParamType {
            name: name.to_string(),
            expected: "value",
        })
    }

    /// A parameter object by name.
    pub fn param_object(&self, name: &str) -> Result<&Arc<dyn ParameterObject>, ContextError> {
        self.param(name)?
            .as_object()
            .ok_or(ContextError::ParamType {
                name: name.to_string(),
                expected: "parameter object",
            })
    }

    /// A parameter object downcast to its concrete type.
    pub fn param_object_as<T: 'static>(&self, name: &str) -> Result<&T, ContextError> {
        self.param_object(name)?
            .as_any()
            .downcast_ref()
            .ok_or(ContextError::ParamType {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    // -- inputs -------------------------------------------------------------

    /// The value of a single input task. Accepts the declared reference or
    /// any unambiguous shortening of the resolved name.
    pub fn input(&self, name: &str) -> Result<Arc<TaskValue>, ContextError> {
        match &self.find_input(name)?.input {
            RunInput::Single { value, .. } => Ok(value.clone()),
            RunInput::Default { value } => Ok(value.clone()),
            RunInput::Object { fullname, .. } => {
                Err(ContextError::InputIsObject(fullname.clone()))
            }
            RunInput::Many { items } => match items.as_slice() {
                [(_, value)] => Ok(value.clone()),
                _ => Err(ContextError::InputNotSingle(name.to_string(), items.len())),
            },
        }
    }

    /// The JSON payload of a single input.
    pub fn input_json(&self, name: &str) -> Result<Arc<Value>, ContextError> {
        match &*self.input(name)? {
            TaskValue::Json(value) => Ok(value.clone()),
            other => Err(ContextError::InputType(
                name.to_string(),
                match other {
                    TaskValue::Dir(_) => "json value (found directory)",
                    TaskValue::Stream(_) => "json value (found stream)",
                    TaskValue::Json(_) => unreachable!(),
                },
            )),
        }
    }

    /// Every value matched by a regex input, ordered by full name.
    pub fn input_all(&self, name: &str) -> Result<Vec<(String, Arc<TaskValue>)>, ContextError> {
        match &self.find_input(name)?.input {
            RunInput::Many { items } => Ok(items.clone()),
            RunInput::Single { fullname, value } => {
                Ok(vec![(fullname.clone(), value.clone())])
            }
            RunInput::Default { .. } => Ok(Vec::new()),
            RunInput::Object { fullname, .. } => {
                Err(ContextError::InputIsObject(fullname.clone()))
            }
        }
    }

    /// The task instance behind an input declared `as_object`.
    pub fn input_task(&self, name: &str) -> Result<Arc<TaskInstance>, ContextError> {
        match &self.find_input(name)?.input {
            RunInput::Object { task, .. } => Ok(task.clone()),
            _ => Err(ContextError::InputNotFound(format!(
                "{name} (not declared as_object)"
            ))),
        }
    }

    fn find_input(&self, name: &str) -> Result<&RunInputEntry, ContextError> {
        if let Some(entry) = self.inputs.iter().find(|entry| entry.declared == name) {
            return Ok(entry);
        }
        // Fall back to the task-name search over resolved names.
        let candidates: Vec<&str> = self
            .inputs
            .iter()
            .flat_map(|entry| match &entry.input {
                RunInput::Single { fullname, .. } => vec![fullname.as_str()],
                RunInput::Object { fullname, .. } => vec![fullname.as_str()],
                _ => vec![],
            })
            .collect();
        let found = find_full_name(name, candidates.into_iter(), NamespaceMode::Ignore)
            .map_err(|_| ContextError::InputNotFound(name.to_string()))?;
        self.inputs
            .iter()
            .find(|entry| match &entry.input {
                RunInput::Single { fullname, .. } => fullname == &found,
                RunInput::Object { fullname, .. } => fullname == &found,
                _ => false,
            })
            .ok_or_else(|| ContextError::InputNotFound(name.to_string()))
    }

    // -- environment --------------------------------------------------------

    /// The directory this run populates. Only directory-backed and
    /// continuable handlers have one. For continuable runs it may already
    /// hold checkpoints from an aborted attempt.
    pub fn dir(&self) -> Result<&Utf8Path, ContextError> {
        self.working_dir.as_deref().ok_or(ContextError::NoWorkingDir)
    }

    /// Append a line to the task's run log.
    pub fn log(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.log.write(message);
        tracing::info!(task = %self.task, "{message}");
        if console_enabled(LogLevel::Info) {
            eprintln!("{} - {message}", self.task);
        }
    }

    /// Append a record to the run-info sidecar, any JSON-like value.
    pub fn save_to_run_info(&mut self, record: Value) {
        self.records.push(record);
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl TaskInstance {
    /// The persistence handler of this instance, bound to its artifact
    /// location.
    pub fn handler(&self) -> Result<Handler, EvalError> {
        Ok(Handler::new(
            self.spec().handler(),
            self.dir(),
            self.persist_name()?,
        ))
    }

    /// The result of this task.
    ///
    /// Returns the cached in-memory value when present. Otherwise takes the
    /// artifact lock, loads the persisted artifact if it exists, is finished
    /// and the task is not forced, and runs the task if not. Two consecutive
    /// calls return the same shared value.
    pub fn value(&self) -> Result<Arc<TaskValue>, EvalError> {
        if let Some(value) = self.state.lock().unwrap().value.clone() {
            return Ok(value);
        }

        let handler = self.handler()?;

        // The lock serializes computation of one fingerprint across
        // processes. In-memory tasks have no artifact and need none.
        let _lock = match handler.data_path() {
            Some(_) => Some(ArtifactLock::acquire(&handler.lock_path())?),
            None => None,
        };

        let value = if !self.is_forced() && handler.is_finished() {
            tracing::debug!(task = %self.fullname(), "loading persisted value");
            Arc::new(handler.load()?)
        } else {
            self.run(&handler)?
        };

        let mut state = self.state.lock().unwrap();
        state.value = Some(value.clone());
        state.forced = false;
        Ok(value)
    }

    /// Whether a finished artifact for this instance exists on disk.
    pub fn has_data(&self) -> Result<bool, EvalError> {
        Ok(self.handler()?.is_finished())
    }

    /// Path of the persisted artifact, `None` for in-memory tasks. The path
    /// may not exist yet.
    pub fn data_path(&self) -> Result<Option<Utf8PathBuf>, EvalError> {
        Ok(self.handler()?.data_path())
    }

    /// The run-info sidecar of the last finished run.
    pub fn run_info(&self) -> Result<RunInfo, EvalError> {
        let handler = self.handler()?;
        Ok(RunInfo::load(&handler.run_info_path())?)
    }

    /// The log of the last run, as rows.
    pub fn log(&self) -> Result<Vec<String>, EvalError> {
        let handler = self.handler()?;
        Ok(crate::data::read_log(&handler.log_path())?)
    }

    pub(crate) fn delete_data(&self) -> Result<(), EvalError> {
        Ok(self.handler()?.delete()?)
    }

    pub(crate) fn force_mark(&self, delete_data: bool) -> Result<(), EvalError> {
        if delete_data {
            self.delete_data()?;
        }
        let mut state = self.state.lock().unwrap();
        state.forced = true;
        state.value = None;
        Ok(())
    }

    fn run(&self, handler: &Handler) -> Result<Arc<TaskValue>, EvalError> {
        let (inputs, input_fingerprints) = self.evaluate_inputs()?;

        let persisting = handler.data_path().is_some();
        if persisting {
            handler.ensure_dir()?;
        }
        if let Some(working_dir) = handler.working_dir() {
            fs::create_dir_all(&working_dir).map_err(|source| DataError::Io {
                path: working_dir.clone(),
                source,
            })?;
        }

        let mut run_info = RunInfo::begin(
            RunInfoTask {
                name: self.slugname(),
                key: self.spec().key().to_string(),
            },
            RunInfoConfig {
                name: self.config().name().to_string(),
                namespace: self.config().namespace().map(str::to_string),
                context: self.context_name().map(str::to_string),
            },
            self.params().reprs(),
            input_fingerprints,
        );

        let mut log = RunLog::create(persisting.then(|| handler.log_path()));
        log.write(&format!(
            "{} - run started with params: {:?}",
            self.fullname(),
            self.params(),
        ));
        tracing::info!(task = %self.fullname(), "run started");

        let mut context = RunContext {
            task: self.fullname().to_string(),
            params: self.params(),
            inputs,
            working_dir: handler.working_dir(),
            log: &mut log,
            records: Vec::new(),
        };

        let output = (self.spec().run_fn())(&mut context);
        let records = std::mem::take(&mut context.records);
        drop(context);

        let output = match output {
            Ok(output) => output,
            Err(error) => {
                log.write(&format!("{} - run failed: {error:#}", self.fullname()));
                log.close();
                if console_enabled(LogLevel::Error) {
                    eprintln!("{} - run failed: {error:#}", self.fullname());
                }
                self.clean_failed_run(handler);
                return Err(EvalError::Run {
                    task: self.fullname().to_string(),
                    error,
                });
            }
        };

        let value = self.persist(handler, output)?;

        run_info.log = records;
        run_info.finish();
        if persisting {
            run_info.save(&handler.run_info_path())?;
        }
        log.write(&format!("{} - run ended", self.fullname()));
        log.close();
        tracing::info!(task = %self.fullname(), "run ended");

        Ok(Arc::new(value))
    }

    /// Request values for every linked input. Inputs linked `as_object` are
    /// handed over unevaluated.
    fn evaluate_inputs(
        &self,
    ) -> Result<(Vec<RunInputEntry>, BTreeMap<String, String>), EvalError> {
        let entries = self.input_entries();
        let mut inputs = Vec::with_capacity(entries.len());
        let mut fingerprints = BTreeMap::new();

        for entry in entries.iter() {
            let mut resolved = Vec::with_capacity(entry.resolved.len());
            for (fullname, weak) in &entry.resolved {
                let task = weak.upgrade().ok_or_else(|| EvalError::ChainDropped {
                    task: self.fullname().to_string(),
                    input: fullname.clone(),
                })?;
                fingerprints.insert(fullname.clone(), task.fingerprint()?.to_string());
                resolved.push((fullname.clone(), task));
            }

            let input = if resolved.is_empty() {
                match &entry.default {
                    Some(default) => RunInput::Default {
                        value: Arc::new(TaskValue::Json(Arc::new(default.clone()))),
                    },
                    None => RunInput::Many { items: Vec::new() },
                }
            } else if entry.as_object {
                let (fullname, task) = resolved.into_iter().next().unwrap();
                RunInput::Object { fullname, task }
            } else if resolved.len() == 1 {
                let (fullname, task) = resolved.into_iter().next().unwrap();
                let value = task.value()?;
                RunInput::Single { fullname, value }
            } else {
                let mut items = Vec::with_capacity(resolved.len());
                for (fullname, task) in resolved {
                    items.push((fullname, task.value()?));
                }
                RunInput::Many { items }
            };

            inputs.push(RunInputEntry {
                declared: entry.declared.clone(),
                input,
            });
        }

        Ok((inputs, fingerprints))
    }

    /// Validate the run output against the declared return kind and hand it
    /// to the handler.
    fn persist(&self, handler: &Handler, output: RunOutput) -> Result<TaskValue, EvalError> {
        let declared = self.spec().return_kind();
        let type_error = |got: String| EvalError::ReturnType {
            task: self.fullname().to_string(),
            expected: declared.name(),
            got,
        };

        match (handler.kind(), output) {
            (HandlerKind::Memory, RunOutput::Value(value)) => {
                if !declared.accepts(&value) {
                    return Err(type_error(crate::value::json_type_name(&value).to_string()));
                }
                Ok(TaskValue::Json(Arc::new(value)))
            }
            (HandlerKind::File, RunOutput::Value(value)) => {
                if !declared.accepts(&value) {
                    return Err(type_error(crate::value::json_type_name(&value).to_string()));
                }
                Ok(handler.save_json(&value)?)
            }
            (HandlerKind::Stream, RunOutput::Stream(values)) => Ok(handler.save_stream(values)?),
            (HandlerKind::Directory | HandlerKind::Continuable, RunOutput::Dir) => {
                Ok(handler.save_dir()?)
            }
            (_, output) => Err(type_error(output.type_name().to_string())),
        }
    }

    /// A failed directory-backed run leaves no staging directory behind. The
    /// continuable handler keeps its checkpoints by contract.
    fn clean_failed_run(&self, handler: &Handler) {
        if handler.kind() == HandlerKind::Directory {
            if let Some(staging) = handler.working_dir() {
                let _ = fs::remove_dir_all(staging);
            }
        }
    }
}
