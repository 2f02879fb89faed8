use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// The durable extension of the invocation record: one JSON file per cached
/// identity digest.
///
/// Entries are only ever created or deleted, never mutated in place. A
/// corrupt entry is removed so the call falls through to normal execution.
/// Failures are never persisted, so a fresh process retries them.
#[derive(Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, uid: &str) -> PathBuf {
        self.dir.join(format!("{uid}.json"))
    }

    /// Restores a stored result, deleting the entry if it cannot be read.
    pub(crate) fn load<T: DeserializeOwned>(&self, uid: &str) -> Option<T> {
        let path = self.path(uid);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    %err,
                    "cached result could not be read, resetting the entry",
                );
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Persists a successfully computed result.
    ///
    /// A write failure is logged, not raised: the in-memory record already
    /// holds the authoritative result for this process.
    pub(crate) fn store<T: Serialize>(&self, uid: &str, value: &T) {
        let path = self.path(uid);
        match self.write(&path, value) {
            Ok(()) => debug!(path = %path.display(), "stored cached result"),
            Err(err) => warn!(path = %path.display(), %err, "failed to store cached result"),
        }
    }

    fn write<T: Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec(value)?;
        fs::write(path, bytes)?;
        Ok(())
    }
}
