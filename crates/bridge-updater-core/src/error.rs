//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Typed failure taxonomy for every cycle component."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

/// Failure running an external program.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Revision source failures.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The on-disk tree is missing or its identifier cannot be read.
    #[error("local source tree unavailable: {0}")]
    SourceUnavailable(String),
    /// The remote could not be reached; retried on the next tick.
    #[error("remote source unreachable: {0}")]
    NetworkUnavailable(String),
    /// The local tree could not be overwritten with the target revision.
    #[error("materialize failed: {0}")]
    MaterializeFailed(String),
}

/// Overlay snapshot/restore failures.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("overlay snapshot of {path} failed: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("overlay restore to {path} failed: {source}")]
    Restore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Dependency refresh failures.
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("dependency install failed: {0}")]
    Install(#[from] CommandError),
    #[error("unable to read manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Service controller failures.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The unit did not re-enter Running within the bounded wait.
    #[error("restart of {unit} failed: {reason}")]
    RestartFailed { unit: String, reason: String },
    #[error("process supervisor error: {0}")]
    Supervisor(#[from] CommandError),
}

/// LocalState persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state record {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Single-instance guard failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another cycle holds {0}")]
    AlreadyRunning(PathBuf),
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure establishing the installed state before a cycle or a check.
#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Manifest(#[from] DependencyError),
}
