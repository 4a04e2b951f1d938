//! Cross-process coordination.
//!
//! Every artifact path has an advisory file lock taken before the engine
//! reads or computes, which guarantees at most one concurrent computation per
//! fingerprint across processes. The lock is held through a RAII guard and
//! released on drop, including on the error paths out of a run.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;

use crate::error::EvalError;

/// An exclusive advisory lock on an artifact path, held while the guard
/// lives.
pub(crate) struct ArtifactLock {
    file: fs::File,
    path: Utf8PathBuf,
}

impl ArtifactLock {
    /// Block until the lock on `path` is ours.
    pub(crate) fn acquire(path: &Utf8Path) -> Result<Self, EvalError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| EvalError::Lock {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| EvalError::Lock {
                path: path.to_path_buf(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| EvalError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        tracing::trace!(path = %self.path, "released artifact lock");
    }
}
