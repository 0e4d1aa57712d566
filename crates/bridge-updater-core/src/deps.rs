//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Dependency auditor and manifest-driven dependency refresh."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bridge_updater_common::config::DependencyConfig;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::command;
use crate::error::{CommandError, DependencyError};
use crate::revision::DiffSet;

/// Why a dependency refresh is required for this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// The manifest is part of the revision diff.
    ManifestChanged,
    /// The manifest on disk differs from the one last installed, left behind
    /// by an earlier cycle whose install failed.
    InstalledManifestStale,
}

impl RefreshReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshReason::ManifestChanged => "manifest-changed",
            RefreshReason::InstalledManifestStale => "installed-manifest-stale",
        }
    }
}

/// Decides from a diff whether dependencies must be reinstalled.
#[derive(Debug, Clone)]
pub struct DependencyAuditor {
    manifest: PathBuf,
}

impl DependencyAuditor {
    /// `manifest` is relative to the install root, matching [`DiffSet`] paths.
    pub fn new(manifest: impl Into<PathBuf>) -> Self {
        Self {
            manifest: manifest.into(),
        }
    }

    pub fn manifest(&self) -> &Path {
        &self.manifest
    }

    /// True iff the manifest is a member of `diff`.
    pub fn needs_refresh(&self, diff: &DiffSet) -> bool {
        diff.contains(&self.manifest)
    }

    /// Combine diff membership with the installed-manifest record.
    pub fn refresh_reason(
        &self,
        diff: &DiffSet,
        installed_hash: Option<&str>,
        on_disk_hash: Option<&str>,
    ) -> Option<RefreshReason> {
        if self.needs_refresh(diff) {
            Some(RefreshReason::ManifestChanged)
        } else if installed_hash != on_disk_hash {
            Some(RefreshReason::InstalledManifestStale)
        } else {
            None
        }
    }

    /// SHA-256 of the manifest under `root`, `None` when the revision ships none.
    pub fn manifest_hash(&self, root: &Path) -> Result<Option<String>, DependencyError> {
        let path = root.join(&self.manifest);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(hex::encode(Sha256::digest(&bytes)))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(DependencyError::Manifest { path, source }),
        }
    }
}

/// Installs the service's dependencies from the manifest.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self) -> Result<(), DependencyError>;
}

/// Runs a configured install command (e.g. `pip install -r requirements.txt`).
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    root: PathBuf,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandInstaller {
    pub fn from_config(root: impl Into<PathBuf>, config: &DependencyConfig) -> Result<Self, DependencyError> {
        let mut parts = config.install_command.iter().cloned();
        let program = parts.next().ok_or_else(|| {
            DependencyError::Install(CommandError::Failed {
                program: String::new(),
                code: None,
                stderr: "install command is empty".to_owned(),
            })
        })?;
        Ok(Self {
            root: root.into(),
            program,
            args: parts.collect(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl DependencyInstaller for CommandInstaller {
    async fn install(&self) -> Result<(), DependencyError> {
        info!(program = %self.program, timeout = ?self.timeout, "installing dependencies");
        command::run(&self.program, &self.args, Some(&self.root), self.timeout).await?;
        Ok(())
    }
}
