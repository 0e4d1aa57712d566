//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Persisted LocalState record and its atomic store."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StateError;
use crate::revision::RevisionId;
use crate::service::ServiceState;

/// The installed revision and the manifest its dependencies were installed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalState {
    pub revision: RevisionId,
    /// SHA-256 of the installed manifest, `None` when the revision has none.
    pub manifest_hash: Option<String>,
    /// `None` until the record has been committed once.
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub service_state: Option<ServiceState>,
}

impl LocalState {
    /// In-memory record for a device whose state was never committed.
    pub fn seeded(revision: RevisionId, manifest_hash: Option<String>) -> Self {
        Self {
            revision,
            manifest_hash,
            committed_at: None,
            service_state: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.committed_at.is_some()
    }
}

/// JSON file holding the committed [`LocalState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the committed record, `None` when nothing was committed yet.
    pub fn load(&self) -> Result<Option<LocalState>, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Replace the record atomically: readers see the old or the new record, never a mix.
    pub fn commit(&self, state: &LocalState) -> Result<(), StateError> {
        let io_err = |source: io::Error| StateError::Io {
            path: self.path.clone(),
            source,
        };
        let body = serde_json::to_vec_pretty(state).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(io_err)?;
        let mut staged = tempfile::Builder::new()
            .prefix(".state-")
            .suffix(".json")
            .tempfile_in(parent)
            .map_err(io_err)?;
        staged.write_all(&body).map_err(io_err)?;
        staged.write_all(b"\n").map_err(io_err)?;
        staged.as_file().sync_all().map_err(io_err)?;
        staged
            .persist(&self.path)
            .map_err(|err| io_err(err.error))?;
        debug!(
            path = %self.path.display(),
            revision = %state.revision.short(),
            "local state committed"
        );
        Ok(())
    }
}
