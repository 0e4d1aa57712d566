//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Revision source client: local/remote identifiers and tree materialization."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bridge_updater_common::config::SourceConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command;
use crate::error::{CommandError, SourceError};

/// Local git plumbing never touches the network, so it gets a fixed bound.
const LOCAL_GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Opaque identifier of a published snapshot of the service source tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map_or(self.0.len(), |(idx, _)| idx);
        &self.0[..end]
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Paths (relative to the install root) that differ between two revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSet {
    paths: BTreeSet<PathBuf>,
}

impl DiffSet {
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Parse NUL-separated `git diff --name-only -z` output.
    fn from_nul_separated(raw: &str) -> Self {
        raw.split('\0')
            .filter(|entry| !entry.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for DiffSet {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Access to the versioned source of the managed service.
#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// Identifier of the tree currently on disk.
    async fn current_local(&self) -> Result<RevisionId, SourceError>;

    /// Latest identifier published by the remote.
    async fn latest_remote(&self) -> Result<RevisionId, SourceError>;

    /// Force the local tree to exactly `target`, returning the changed paths.
    async fn materialize(&self, target: &RevisionId) -> Result<DiffSet, SourceError>;
}

/// [`RevisionSource`] backed by a git checkout of the service repository.
///
/// Updating is a hard reset onto the fetched remote commit: tracked local
/// edits are discarded, untracked and ignored files (the overlay, virtualenv)
/// are left alone.
#[derive(Debug, Clone)]
pub struct GitRevisionSource {
    root: PathBuf,
    git: String,
    remote: String,
    branch: String,
    fetch_timeout: Duration,
}

impl GitRevisionSource {
    pub fn new(root: impl Into<PathBuf>, config: &SourceConfig) -> Self {
        Self {
            root: root.into(),
            git: config.git_binary.clone(),
            remote: config.remote.clone(),
            branch: config.branch.clone(),
            fetch_timeout: config.fetch_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git<I, S>(&self, args: I, timeout: Duration) -> Result<String, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut full: Vec<std::ffi::OsString> = vec!["-C".into(), self.root.clone().into()];
        full.extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        command::run(&self.git, full, None, timeout)
            .await
            .map(|output| output.stdout_trimmed().to_owned())
    }
}

#[async_trait]
impl RevisionSource for GitRevisionSource {
    async fn current_local(&self) -> Result<RevisionId, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::SourceUnavailable(format!(
                "install root {} does not exist",
                self.root.display()
            )));
        }
        let head = self
            .git(["rev-parse", "--verify", "HEAD^{commit}"], LOCAL_GIT_TIMEOUT)
            .await
            .map_err(|err| SourceError::SourceUnavailable(err.to_string()))?;
        Ok(RevisionId::new(head))
    }

    async fn latest_remote(&self) -> Result<RevisionId, SourceError> {
        debug!(remote = %self.remote, branch = %self.branch, "fetching remote revision");
        self.git(
            ["fetch", "--quiet", "--no-tags", self.remote.as_str(), self.branch.as_str()],
            self.fetch_timeout,
        )
        .await
        .map_err(|err| SourceError::NetworkUnavailable(err.to_string()))?;
        let fetched = self
            .git(
                ["rev-parse", "--verify", "FETCH_HEAD^{commit}"],
                LOCAL_GIT_TIMEOUT,
            )
            .await
            .map_err(|err| SourceError::NetworkUnavailable(err.to_string()))?;
        Ok(RevisionId::new(fetched))
    }

    async fn materialize(&self, target: &RevisionId) -> Result<DiffSet, SourceError> {
        let diff = self
            .git(
                [
                    "diff",
                    "--name-only",
                    "--no-renames",
                    "-z",
                    "HEAD",
                    target.as_str(),
                ],
                LOCAL_GIT_TIMEOUT,
            )
            .await
            .map_err(|err| SourceError::MaterializeFailed(err.to_string()))?;
        self.git(["reset", "--hard", "--quiet", target.as_str()], LOCAL_GIT_TIMEOUT)
            .await
            .map_err(|err| SourceError::MaterializeFailed(err.to_string()))?;
        let diff = DiffSet::from_nul_separated(&diff);
        info!(
            target = %target.short(),
            changed = diff.len(),
            "tree materialized"
        );
        Ok(diff)
    }
}
