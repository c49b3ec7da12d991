use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tracing::debug;

use crate::host::ChainState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state file {path} is not valid: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Another process holds `<state>.lock`; its pid is written in that file.
    #[error("state file {path} is in use by another process (see {lock})")]
    Locked { path: PathBuf, lock: PathBuf },
}

/// Exclusive hold on a state file, released on drop.
///
/// Every load -> execute -> save sequence runs under one of these so two
/// processes never commit against the same snapshot.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // the lock file itself stays; removing it would race with a waiter
        let _ = FileExt::unlock(&self.file);
    }
}

/// JSON file holding the whole [`ChainState`].
#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the process-level lock on `<path>.lock` without blocking.
    pub fn lock(&self) -> Result<StateLock, StoreError> {
        self.ensure_parent()?;
        let lock_path = self.sibling(".lock");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| self.io_err(e))?;
        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(StoreError::Locked {
                    path: self.path.clone(),
                    lock: lock_path,
                });
            }
            return Err(self.io_err(err));
        }
        file.set_len(0).map_err(|e| self.io_err(e))?;
        writeln!(file, "{}", std::process::id()).map_err(|e| self.io_err(e))?;
        debug!(lock = %lock_path.display(), "state lock acquired");
        Ok(StateLock {
            file,
            path: lock_path,
        })
    }

    /// Missing file means a fresh chain.
    pub fn load(&self) -> Result<ChainState, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file, starting from genesis");
                return Ok(ChainState::default());
            }
            Err(source) => return Err(self.io_err(source)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes to `<path>.tmp` and renames it over the target.
    pub fn save(&self, state: &ChainState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        self.ensure_parent()?;
        let tmp = self.sibling(".tmp");
        let mut f = File::create(&tmp).map_err(|e| self.io_err(e))?;
        f.write_all(&json).map_err(|e| self.io_err(e))?;
        f.sync_all().map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        debug!(path = %self.path.display(), height = state.height, "state saved");
        Ok(())
    }

    fn ensure_parent(&self) -> Result<(), StoreError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))
            }
            _ => Ok(()),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
