//! Shared fixtures: a small analytics pipeline `source -> doubled -> total`
//! with run counters, plus config helpers.

// Each integration binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{json, Value};
use taskchain::{
    Config, InputSpec, ParamKind, ParamSpec, Registry, ReturnKind, RunOutput, TaskSpec,
};

pub type Counts = Arc<Mutex<BTreeMap<String, usize>>>;
pub type Calls = Arc<Mutex<Vec<String>>>;

pub struct TestEnv {
    pub registry: Arc<Registry>,
    pub counts: Counts,
    pub calls: Calls,
    /// Removed from disk when the env drops.
    _root: tempfile::TempDir,
    root_path: Utf8PathBuf,
}

impl TestEnv {
    pub fn root(&self) -> &Utf8Path {
        &self.root_path
    }

    /// Load an in-memory config against the shared registry.
    pub fn config(&self, name: &str, value: Value) -> Config {
        Config::builder(self.root(), &self.registry)
            .load_data(name, value)
            .unwrap()
    }

    pub fn count(&self, task: &str) -> usize {
        *self.counts.lock().unwrap().get(task).unwrap_or(&0)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn bump(counts: &Counts, calls: &Calls, task: &str) {
    *counts.lock().unwrap().entry(task.to_string()).or_insert(0) += 1;
    calls.lock().unwrap().push(task.to_string());
}

pub fn env() -> TestEnv {
    let counts: Counts = Arc::new(Mutex::new(BTreeMap::new()));
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));

    let mut registry = Registry::new();

    let (c, l) = (counts.clone(), calls.clone());
    registry.register_task(
        TaskSpec::new("pipeline.SourceTask", move |ctx| {
            bump(&c, &l, "source");
            let x = ctx.param_int("x")?;
            Ok(RunOutput::Value(json!((0..x).collect::<Vec<i64>>())))
        })
        .in_group("data")
        .with_param(ParamSpec::new("x").kind(ParamKind::Int))
        .with_param(
            ParamSpec::new("verbose")
                .kind(ParamKind::Bool)
                .default_value(json!(false))
                .ignore_persistence(),
        )
        .returns(ReturnKind::Seq),
    );

    let (c, l) = (counts.clone(), calls.clone());
    registry.register_task(
        TaskSpec::new("pipeline.DoubledTask", move |ctx| {
            bump(&c, &l, "doubled");
            let source = ctx.input_json("source")?;
            let doubled: Vec<i64> = source
                .as_array()
                .unwrap()
                .iter()
                .filter_map(Value::as_i64)
                .map(|n| n * 2)
                .collect();
            Ok(RunOutput::Value(json!(doubled)))
        })
        .in_group("data")
        .with_input(InputSpec::new("source"))
        .returns(ReturnKind::Seq),
    );

    let (c, l) = (counts.clone(), calls.clone());
    registry.register_task(
        TaskSpec::new("pipeline.TotalTask", move |ctx| {
            bump(&c, &l, "total");
            let doubled = ctx.input_json("doubled")?;
            let total: i64 = doubled
                .as_array()
                .unwrap()
                .iter()
                .filter_map(Value::as_i64)
                .sum();
            Ok(RunOutput::Value(json!(total)))
        })
        .in_group("stats")
        .with_input(InputSpec::new("doubled"))
        .returns(ReturnKind::Int),
    );

    let root = tempfile::tempdir().unwrap();
    let root_path = Utf8PathBuf::from_path_buf(root.path().to_path_buf()).unwrap();

    TestEnv {
        registry: registry.finish(),
        counts,
        calls,
        _root: root,
        root_path,
    }
}

/// Write a config file into the env's temp dir and return its path.
pub fn write_config(env: &TestEnv, name: &str, text: &str) -> Utf8PathBuf {
    let path = env.root().join(name);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).unwrap();
    }
    fs::write(&path, text).unwrap();
    path
}
