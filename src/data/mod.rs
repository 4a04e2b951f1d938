//! The persistence layer.
//!
//! Every task pairs with a [`Handler`], the strategy that saves, loads and
//! reports existence of its artifact. The handler family is chosen from the
//! declared return kind unless the task spec overrides it. All artifacts of
//! one task live in one directory and are keyed by the instance's persist
//! name (the fingerprint in parameter mode), with the run-info and log files
//! as siblings:
//!
//! ```text
//! <root>/<group-path>/<task-name>/<stem>.<ext>
//! <root>/<group-path>/<task-name>/<stem>.run_info.yaml
//! <root>/<group-path>/<task-name>/<stem>.log
//! ```

mod run_info;

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::error::DataError;
use crate::value::TaskValue;

pub use run_info::{RunInfo, RunInfoConfig, RunInfoTask};

/// The handler families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Never persists, the value lives only for the life of the process.
    Memory,
    /// One JSON file keyed by the persist name.
    File,
    /// A directory the task populates, moved into place on success.
    Directory,
    /// A directory with a completion sentinel. The task may finish partially
    /// and resume from existing checkpoints on the next invocation.
    Continuable,
    /// A lazy sequence persisted as JSON lines, iterated lazily on reload.
    Stream,
}

/// A handle to a directory-backed artifact.
#[derive(Debug, Clone)]
pub struct DirHandle {
    path: Utf8PathBuf,
}

impl DirHandle {
    pub(crate) fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    /// The artifact directory.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// A handle to a JSON-lines artifact.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    path: Utf8PathBuf,
}

impl StreamHandle {
    pub(crate) fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Iterate the persisted values without reading the whole file.
    pub fn iter(&self) -> Result<StreamIter, DataError> {
        let file = fs::File::open(&self.path).map_err(|source| DataError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(StreamIter {
            lines: BufReader::new(file).lines(),
            path: self.path.clone(),
        })
    }

    /// Read the whole sequence into memory.
    pub fn collect(&self) -> Result<Vec<Value>, DataError> {
        self.iter()?.collect()
    }
}

/// Lazy reader over a JSON-lines artifact.
pub struct StreamIter {
    lines: std::io::Lines<BufReader<fs::File>>,
    path: Utf8PathBuf,
}

impl Iterator for StreamIter {
    type Item = Result<Value, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(source) => {
                return Some(Err(DataError::Io {
                    path: self.path.clone(),
                    source,
                }))
            }
        };
        Some(
            serde_json::from_str(&line).map_err(|source| DataError::Decode {
                path: self.path.clone(),
                source,
            }),
        )
    }
}

/// The persistence strategy of one task instance, bound to its artifact
/// location.
#[derive(Debug, Clone)]
pub struct Handler {
    kind: HandlerKind,
    dir: Utf8PathBuf,
    stem: String,
}

impl Handler {
    pub(crate) fn new(kind: HandlerKind, dir: Utf8PathBuf, stem: String) -> Self {
        Self { kind, dir, stem }
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// The artifact path, `None` for the in-memory handler.
    pub fn data_path(&self) -> Option<Utf8PathBuf> {
        let name = match self.kind {
            HandlerKind::Memory => return None,
            HandlerKind::File => format!("{}.json", self.stem),
            HandlerKind::Stream => format!("{}.jsonl", self.stem),
            HandlerKind::Directory | HandlerKind::Continuable => self.stem.clone(),
        };
        Some(self.dir.join(name))
    }

    /// Path of the run-info sidecar.
    pub fn run_info_path(&self) -> Utf8PathBuf {
        self.dir.join(format!("{}.run_info.yaml", self.stem))
    }

    /// Path of the log sibling.
    pub fn log_path(&self) -> Utf8PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    /// Path the advisory lock is taken on.
    pub(crate) fn lock_path(&self) -> Utf8PathBuf {
        self.dir.join(format!("{}.lock", self.stem))
    }

    /// Whether the artifact exists on disk at all.
    pub fn exists(&self) -> bool {
        match self.data_path() {
            Some(path) => path.as_std_path().exists(),
            None => false,
        }
    }

    /// Whether the artifact exists and is complete. Only the continuable
    /// handler distinguishes the two, through its sentinel file.
    pub fn is_finished(&self) -> bool {
        match self.kind {
            HandlerKind::Continuable => self.sentinel_path().as_std_path().exists(),
            _ => self.exists(),
        }
    }

    /// Drop the completion sentinel of a continuable artifact.
    pub fn mark_finished(&self) -> Result<(), DataError> {
        let path = self.sentinel_path();
        fs::write(&path, b"").map_err(|source| DataError::Io { path, source })
    }

    fn sentinel_path(&self) -> Utf8PathBuf {
        self.dir.join(self.stem.as_str()).join(".finished")
    }

    /// The directory a run populates. For the directory handler this is a
    /// staging directory moved into place on success, the continuable handler
    /// works in the final location so that checkpoints survive aborts.
    pub(crate) fn working_dir(&self) -> Option<Utf8PathBuf> {
        match self.kind {
            HandlerKind::Directory => Some(self.dir.join(format!("{}.tmp", self.stem))),
            HandlerKind::Continuable => Some(self.dir.join(self.stem.as_str())),
            _ => None,
        }
    }

    /// Load the persisted artifact.
    pub fn load(&self) -> Result<TaskValue, DataError> {
        let path = self
            .data_path()
            .ok_or_else(|| DataError::NotPersisting(self.stem.clone()))?;
        match self.kind {
            HandlerKind::Memory => unreachable!(),
            HandlerKind::File => {
                let text = fs::read_to_string(&path).map_err(|source| DataError::Io {
                    path: path.clone(),
                    source,
                })?;
                let value = serde_json::from_str(&text)
                    .map_err(|source| DataError::Decode { path, source })?;
                Ok(TaskValue::Json(std::sync::Arc::new(value)))
            }
            HandlerKind::Stream => Ok(TaskValue::Stream(StreamHandle::new(path))),
            HandlerKind::Directory | HandlerKind::Continuable => {
                if !path.as_std_path().exists() {
                    return Err(DataError::NotFound(path));
                }
                Ok(TaskValue::Dir(DirHandle::new(path)))
            }
        }
    }

    /// Persist a JSON value. Written to a temporary sibling first, partial
    /// files never appear under the final name.
    pub fn save_json(&self, value: &Value) -> Result<TaskValue, DataError> {
        let path = self
            .data_path()
            .ok_or_else(|| DataError::NotPersisting(self.stem.clone()))?;
        self.ensure_dir()?;
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(value).map_err(|source| DataError::Encode {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, text).map_err(|source| DataError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| DataError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(TaskValue::Json(std::sync::Arc::new(value.clone())))
    }

    /// Drain a value sequence into the JSON-lines artifact.
    pub fn save_stream(
        &self,
        values: impl Iterator<Item = Value>,
    ) -> Result<TaskValue, DataError> {
        let path = self
            .data_path()
            .ok_or_else(|| DataError::NotPersisting(self.stem.clone()))?;
        self.ensure_dir()?;
        let tmp = path.with_extension("jsonl.tmp");
        let io_err = |source, path: &Utf8Path| DataError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = fs::File::create(&tmp).map_err(|e| io_err(e, &tmp))?;
        let mut writer = BufWriter::new(file);
        for value in values {
            let line = serde_json::to_string(&value).map_err(|source| DataError::Encode {
                path: path.clone(),
                source,
            })?;
            writer.write_all(line.as_bytes()).map_err(|e| io_err(e, &tmp))?;
            writer.write_all(b"\n").map_err(|e| io_err(e, &tmp))?;
        }
        writer.flush().map_err(|e| io_err(e, &tmp))?;
        drop(writer);

        fs::rename(&tmp, &path).map_err(|e| io_err(e, &path))?;
        Ok(TaskValue::Stream(StreamHandle::new(path)))
    }

    /// Finish a directory-backed run: move the staging directory into place,
    /// or drop the sentinel for a continuable one.
    pub fn save_dir(&self) -> Result<TaskValue, DataError> {
        let path = self
            .data_path()
            .ok_or_else(|| DataError::NotPersisting(self.stem.clone()))?;
        match self.kind {
            HandlerKind::Directory => {
                let staging = self.working_dir().unwrap();
                if path.as_std_path().exists() {
                    fs::remove_dir_all(&path).map_err(|source| DataError::Io {
                        path: path.clone(),
                        source,
                    })?;
                }
                fs::rename(&staging, &path).map_err(|source| DataError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
            HandlerKind::Continuable => {
                self.mark_finished()?;
            }
            _ => unreachable!(),
        }
        Ok(TaskValue::Dir(DirHandle::new(path)))
    }

    /// Remove the persisted artifact along with its run-info and log.
    pub fn delete(&self) -> Result<(), DataError> {
        let Some(path) = self.data_path() else {
            return Ok(());
        };
        if path.as_std_path().is_dir() {
            fs::remove_dir_all(&path).map_err(|source| DataError::Io {
                path: path.clone(),
                source,
            })?;
        } else if path.as_std_path().exists() {
            fs::remove_file(&path).map_err(|source| DataError::Io {
                path: path.clone(),
                source,
            })?;
        }
        for sibling in [self.run_info_path(), self.log_path()] {
            if sibling.as_std_path().exists() {
                fs::remove_file(&sibling).map_err(|source| DataError::Io {
                    path: sibling.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    pub(crate) fn ensure_dir(&self) -> Result<(), DataError> {
        fs::create_dir_all(&self.dir).map_err(|source| DataError::Io {
            path: self.dir.clone(),
            source,
        })
    }
}

/// The scoped writer behind a task's `.log` sibling. Created when the task
/// enters its run and closed when the run ends.
pub(crate) struct RunLog {
    writer: Option<BufWriter<fs::File>>,
}

impl RunLog {
    pub(crate) fn create(path: Option<Utf8PathBuf>) -> Self {
        let writer = path
            .and_then(|path| fs::File::create(path).ok())
            .map(BufWriter::new);
        Self { writer }
    }

    pub(crate) fn write(&mut self, message: &str) {
        if let Some(writer) = &mut self.writer {
            let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(writer, "{stamp} {message}");
        }
    }

    pub(crate) fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read a persisted log back as rows.
pub(crate) fn read_log(path: &Utf8Path) -> Result<Vec<String>, DataError> {
    let file = fs::File::open(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    BufReader::new(file)
        .lines()
        .map(|line| {
            line.map_err(|source| DataError::Io {
                path: path.to_path_buf(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler(kind: HandlerKind, dir: &Utf8Path) -> Handler {
        Handler::new(kind, dir.to_path_buf(), "abc123".to_string())
    }

    #[test]
    fn test_file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let handler = handler(HandlerKind::File, dir);

        assert!(!handler.exists());
        let value = json!({"rows": [1, 2, 3], "label": "x"});
        handler.save_json(&value).unwrap();
        assert!(handler.exists());
        assert!(handler.is_finished());

        let loaded = handler.load().unwrap();
        assert_eq!(loaded.as_json().unwrap(), &value);
    }

    #[test]
    fn test_stream_round_trip_lazy() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let handler = handler(HandlerKind::Stream, dir);

        let values = vec![json!(1), json!({"a": 2}), json!("three")];
        handler.save_stream(values.clone().into_iter()).unwrap();

        let loaded = handler.load().unwrap();
        let stream = loaded.as_stream().unwrap();
        let mut iter = stream.iter().unwrap();
        assert_eq!(iter.next().unwrap().unwrap(), json!(1));
        let rest: Vec<_> = iter.map(Result::unwrap).collect();
        assert_eq!(rest, vec![json!({"a": 2}), json!("three")]);
        assert_eq!(stream.collect().unwrap(), values);
    }

    #[test]
    fn test_directory_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let handler = handler(HandlerKind::Directory, dir);

        let staging = handler.working_dir().unwrap();
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("part-0"), b"data").unwrap();
        assert!(!handler.exists());

        let value = handler.save_dir().unwrap();
        assert!(handler.exists());
        let loaded = fs::read(value.as_dir().unwrap().path().join("part-0")).unwrap();
        assert_eq!(loaded, b"data");
        assert!(!staging.as_std_path().exists());
    }

    #[test]
    fn test_continuable_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let handler = handler(HandlerKind::Continuable, dir);

        let work = handler.working_dir().unwrap();
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("checkpoint-1"), b"half").unwrap();

        // Partial progress exists but does not count as finished.
        assert!(handler.exists());
        assert!(!handler.is_finished());

        handler.save_dir().unwrap();
        assert!(handler.is_finished());
    }

    #[test]
    fn test_delete_removes_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let handler = handler(HandlerKind::File, dir);

        handler.save_json(&json!(1)).unwrap();
        fs::write(handler.run_info_path(), "task: {}\n").unwrap();
        fs::write(handler.log_path(), "line\n").unwrap();

        handler.delete().unwrap();
        assert!(!handler.exists());
        assert!(!handler.run_info_path().as_std_path().exists());
        assert!(!handler.log_path().as_std_path().exists());
    }

    #[test]
    fn test_memory_never_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let handler = handler(HandlerKind::Memory, dir);
        assert_eq!(handler.data_path(), None);
        assert!(!handler.exists());
        assert!(handler.save_json(&json!(1)).is_err());
    }
}
