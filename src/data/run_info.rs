//! The run-info sidecar written next to every persisted artifact.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DataError;

/// Identity of the task a run belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfoTask {
    pub name: String,
    pub key: String,
}

/// Identity of the config the run was assembled from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfoConfig {
    pub name: String,
    pub namespace: Option<String>,
    pub context: Option<String>,
}

/// A YAML document recording everything about one run: who computed what,
/// from which inputs, when, and how long it took. Users may append their own
/// records from inside the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub task: RunInfoTask,
    pub config: RunInfoConfig,
    pub parameters: BTreeMap<String, String>,
    /// Fingerprints of every input task, keyed by full name.
    pub input_tasks: BTreeMap<String, String>,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    /// Elapsed seconds.
    pub time: Option<f64>,
    pub user: String,
    #[serde(default)]
    pub log: Vec<Value>,
}

impl RunInfo {
    pub(crate) fn begin(
        task: RunInfoTask,
        config: RunInfoConfig,
        parameters: BTreeMap<String, String>,
        input_tasks: BTreeMap<String, String>,
    ) -> Self {
        Self {
            task,
            config,
            parameters,
            input_tasks,
            started: Utc::now(),
            ended: None,
            time: None,
            user: invoking_user(),
            log: Vec::new(),
        }
    }

    pub(crate) fn finish(&mut self) {
        let now = Utc::now();
        self.time = Some((now - self.started).num_milliseconds() as f64 / 1000.0);
        self.ended = Some(now);
    }

    /// Append a user record, any JSON-like value.
    pub fn append(&mut self, record: Value) {
        self.log.push(record);
    }

    pub(crate) fn save(&self, path: &Utf8Path) -> Result<(), DataError> {
        let text = serde_yaml::to_string(self).map_err(|source| DataError::RunInfo {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the sidecar of the last finished run.
    pub fn load(path: &Utf8Path) -> Result<Self, DataError> {
        let text = fs::read_to_string(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| DataError::RunInfo {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn invoking_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join("x.run_info.yaml");

        let mut info = RunInfo::begin(
            RunInfoTask {
                name: "movies:all_movies".to_string(),
                key: "movies.AllMoviesTask".to_string(),
            },
            RunInfoConfig {
                name: "baseline".to_string(),
                namespace: None,
                context: None,
            },
            BTreeMap::from([("x".to_string(), "5".to_string())]),
            BTreeMap::from([("raw".to_string(), "deadbeef".repeat(4))]),
        );
        info.append(json!({"rows": 120}));
        info.finish();
        info.save(&path).unwrap();

        let loaded = RunInfo::load(&path).unwrap();
        assert_eq!(loaded.task.name, "movies:all_movies");
        assert_eq!(loaded.parameters["x"], "5");
        assert_eq!(loaded.log, vec![json!({"rows": 120})]);
        assert!(loaded.ended.unwrap() >= loaded.started);
        assert!(loaded.time.unwrap() >= 0.0);
    }
}
