//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Update orchestration core for the edge bridge service."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
//! Revision detection, config preservation across revision swaps,
//! conditional dependency refresh and service restart sequencing.

pub mod command;
pub mod deps;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod overlay;
pub mod revision;
pub mod service;
pub mod state;

pub use deps::{CommandInstaller, DependencyAuditor, DependencyInstaller, RefreshReason};
pub use error::{
    CommandError, DependencyError, InspectError, LockError, OverlayError, ServiceError,
    SourceError, StateError,
};
pub use lock::{InstanceGuard, InstanceLock};
pub use metrics::{new_registry, CycleMetrics, SharedRegistry};
pub use orchestrator::{
    CycleOutcome, CycleReport, CycleState, Inspection, Transition, UpdateOrchestrator,
};
pub use overlay::{parse_overlay, ConfigOverlay, ConfigPreserver, RestoreOutcome};
pub use revision::{DiffSet, GitRevisionSource, RevisionId, RevisionSource};
pub use service::{ServiceController, ServiceState, SystemdController};
pub use state::{LocalState, StateStore};
