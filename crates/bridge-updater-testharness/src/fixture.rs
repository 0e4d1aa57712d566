//! ---
//! bridge_section: "03-testharness"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Temporary install roots and a wired orchestrator for tests."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bridge_updater_core::{
    ConfigPreserver, DependencyAuditor, LocalState, StateStore, UpdateOrchestrator,
};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::fakes::{FakeRevisionSource, FakeServiceController, RecordingInstaller};

pub const OVERLAY_FILE: &str = ".env";
pub const OVERLAY_TEMPLATE: &str = ".env.example";
pub const MANIFEST_FILE: &str = "requirements.txt";
pub const LOG_TAG: &str = "yarbo-bridge-update";

/// Temporary directory laid out like a device: install root, state dir and holding dir.
#[derive(Debug)]
pub struct InstallRoot {
    dir: TempDir,
}

impl InstallRoot {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("app"))?;
        Ok(Self { dir })
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("app")
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("state").join("state.json")
    }

    pub fn holding_dir(&self) -> PathBuf {
        self.dir.path().join("holding")
    }

    /// Write `contents` at `rel` under the install root.
    pub fn write(&self, rel: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> io::Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)
    }

    pub fn read(&self, rel: impl AsRef<Path>) -> Option<Vec<u8>> {
        fs::read(self.root().join(rel)).ok()
    }

    pub fn read_string(&self, rel: impl AsRef<Path>) -> Option<String> {
        fs::read_to_string(self.root().join(rel)).ok()
    }

    /// Every file below the base directory with its bytes, for before/after comparisons.
    pub fn tree(&self) -> io::Result<BTreeMap<PathBuf, Vec<u8>>> {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(self.base()).min_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(self.base())
                .unwrap_or(entry.path())
                .to_path_buf();
            files.insert(rel, fs::read(entry.path())?);
        }
        Ok(files)
    }
}

/// Install root plus fakes, producing orchestrators wired to both.
pub struct Harness {
    pub root: InstallRoot,
    pub source: Arc<FakeRevisionSource>,
    pub service: Arc<FakeServiceController>,
    pub installer: Arc<RecordingInstaller>,
}

impl Harness {
    /// Device whose tree is at `local` while the remote publishes `remote`.
    pub fn new(local: &str, remote: &str) -> io::Result<Self> {
        Ok(Self {
            root: InstallRoot::new()?,
            source: Arc::new(FakeRevisionSource::new(local, remote)),
            service: Arc::new(FakeServiceController::new()),
            installer: Arc::new(RecordingInstaller::new()),
        })
    }

    pub fn preserver(&self) -> ConfigPreserver {
        let root = self.root.root();
        ConfigPreserver::new(root.join(OVERLAY_FILE))
            .with_template(root.join(OVERLAY_TEMPLATE))
            .with_holding_dir(self.root.holding_dir())
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.root.state_path())
    }

    pub fn orchestrator(&self) -> UpdateOrchestrator {
        UpdateOrchestrator::new(
            self.root.root(),
            self.source.clone(),
            self.service.clone(),
            self.installer.clone(),
            self.preserver(),
            DependencyAuditor::new(MANIFEST_FILE),
            self.store(),
        )
        .with_tag(LOG_TAG)
    }

    /// The committed LocalState, `None` if nothing was committed.
    pub fn committed(&self) -> Option<LocalState> {
        self.store().load().ok().flatten()
    }
}
