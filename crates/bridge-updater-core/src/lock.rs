//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Single-instance guard so cycles never overlap."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LockError;

/// Advisory exclusive lock on a well-known file.
pub struct InstanceLock {
    path: PathBuf,
    lock: fd_lock::RwLock<File>,
}

/// Held for the duration of one cycle; the lock is released on drop.
pub struct InstanceGuard<'a> {
    _guard: fd_lock::RwLockWriteGuard<'a, File>,
}

impl fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLock").field("path", &self.path).finish()
    }
}

impl fmt::Debug for InstanceGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InstanceGuard")
    }
}

impl InstanceLock {
    /// Open (creating if needed) the lock file. Does not take the lock.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let io_err = |source: io::Error| LockError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;
        Ok(Self {
            lock: fd_lock::RwLock::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without waiting.
    pub fn try_acquire(&mut self) -> Result<InstanceGuard<'_>, LockError> {
        match self.lock.try_write() {
            Ok(guard) => {
                debug!(path = %self.path.display(), "instance lock acquired");
                Ok(InstanceGuard { _guard: guard })
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                Err(LockError::AlreadyRunning(self.path.clone()))
            }
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
