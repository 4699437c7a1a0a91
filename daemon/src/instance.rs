/// Single-instance guard.
///
/// Two supervisors sharing a data directory would fight over installing,
/// launching and killing the same worker. The first one to start takes an
/// exclusive lock on `supervisor.lock`; later ones refuse to run.
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("another supervisor holds {}", path.display())]
    AlreadyRunning {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open lock file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held for the lifetime of the supervisor. The lock goes away with the
/// file handle, including when the process dies.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Takes the lock at `path` without blocking and records our pid in it.
    pub fn acquire(path: &Path) -> Result<Self, InstanceError> {
        let io_err = |source: io::Error| InstanceError::Io { path: path.to_path_buf(), source };

        // No truncate before the lock is ours: the pid belongs to the holder.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        file.try_lock_exclusive()
            .map_err(|source| InstanceError::AlreadyRunning { path: path.to_path_buf(), source })?;

        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        debug!(path = %path.display(), "instance lock acquired");
        Ok(Self { _file: file, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
