//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Update orchestrator state machine sequencing one deployment cycle."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
//! One cycle walks `Idle -> Checking -> Updating -> Restoring ->
//! RefreshingDeps -> Restarting -> Idle`, or stops in `Aborted`. LocalState
//! is committed in exactly one place, after the restart call returns, so
//! every earlier step can be repeated by the next cycle.
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bridge_updater_common::config::AppConfig;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::deps::{CommandInstaller, DependencyAuditor, DependencyInstaller, RefreshReason};
use crate::error::{DependencyError, InspectError, SourceError};
use crate::metrics::CycleMetrics;
use crate::overlay::{ConfigPreserver, RestoreOutcome};
use crate::revision::{GitRevisionSource, RevisionId, RevisionSource};
use crate::service::{ServiceController, ServiceState, SystemdController};
use crate::state::{LocalState, StateStore};

/// Named states of the cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleState {
    Idle,
    Checking,
    Updating,
    Restoring,
    RefreshingDeps,
    Restarting,
    Aborted,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "idle",
            CycleState::Checking => "checking",
            CycleState::Updating => "updating",
            CycleState::Restoring => "restoring",
            CycleState::RefreshingDeps => "refreshing-deps",
            CycleState::Restarting => "restarting",
            CycleState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded edge of the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: CycleState,
    pub to: CycleState,
    pub note: String,
}

/// Result of a cycle. Failures are values here, the caller maps them to an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleOutcome {
    UpToDate,
    NetworkUnavailable,
    Applied,
    MaterializeFailed,
    OverlayFailed,
    DependencyRefreshFailed,
    /// Tree and LocalState are at the new revision but the service is not running.
    ServiceUnhealthy,
    SourceUnavailable,
    StateUnavailable,
    CommitFailed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::UpToDate => "up-to-date",
            CycleOutcome::NetworkUnavailable => "network-unavailable",
            CycleOutcome::Applied => "applied",
            CycleOutcome::MaterializeFailed => "materialize-failed",
            CycleOutcome::OverlayFailed => "overlay-failed",
            CycleOutcome::DependencyRefreshFailed => "dependency-refresh-failed",
            CycleOutcome::ServiceUnhealthy => "service-unhealthy",
            CycleOutcome::SourceUnavailable => "source-unavailable",
            CycleOutcome::StateUnavailable => "state-unavailable",
            CycleOutcome::CommitFailed => "commit-failed",
        }
    }

    /// Process exit code for an on-demand invocation.
    pub fn exit_code(&self) -> i32 {
        match self {
            CycleOutcome::UpToDate | CycleOutcome::NetworkUnavailable | CycleOutcome::Applied => 0,
            CycleOutcome::MaterializeFailed
            | CycleOutcome::OverlayFailed
            | CycleOutcome::DependencyRefreshFailed => 1,
            CycleOutcome::ServiceUnhealthy => 2,
            CycleOutcome::SourceUnavailable
            | CycleOutcome::StateUnavailable
            | CycleOutcome::CommitFailed => 3,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    /// Whether this cycle advanced LocalState.
    pub fn committed(&self) -> bool {
        matches!(self, CycleOutcome::Applied | CycleOutcome::ServiceUnhealthy)
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a caller may want to know about a finished cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcome: CycleOutcome,
    pub transitions: Vec<Transition>,
    pub installed: Option<RevisionId>,
    pub remote: Option<RevisionId>,
    pub changed_paths: Option<usize>,
    #[serde(skip)]
    pub restore: Option<RestoreOutcome>,
    #[serde(serialize_with = "serialize_reason")]
    pub dependency_refresh: Option<RefreshReason>,
    pub service_state: Option<ServiceState>,
    pub error: Option<String>,
}

fn serialize_reason<S: serde::Serializer>(
    reason: &Option<RefreshReason>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match reason {
        Some(reason) => serializer.serialize_some(reason.as_str()),
        None => serializer.serialize_none(),
    }
}

impl CycleReport {
    pub fn final_state(&self) -> CycleState {
        self.transitions
            .last()
            .map_or(CycleState::Idle, |transition| transition.to)
    }
}

/// Result of a read-only comparison of installed and published revisions.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub installed: LocalState,
    /// Revision of the tree on disk, which lags or leads LocalState after a failed cycle.
    pub on_disk: RevisionId,
    pub remote: RevisionId,
}

impl Inspection {
    pub fn update_available(&self) -> bool {
        self.installed.revision != self.remote
    }
}

/// Bookkeeping for one cycle: current state, transitions and report fields.
struct CycleRun<'a> {
    id: u64,
    tag: &'a str,
    state: CycleState,
    report: CycleReport,
}

impl<'a> CycleRun<'a> {
    fn new(id: u64, tag: &'a str) -> Self {
        Self {
            id,
            tag,
            state: CycleState::Idle,
            report: CycleReport {
                cycle: id,
                outcome: CycleOutcome::UpToDate,
                transitions: Vec::new(),
                installed: None,
                remote: None,
                changed_paths: None,
                restore: None,
                dependency_refresh: None,
                service_state: None,
                error: None,
            },
        }
    }

    fn advance(&mut self, to: CycleState, note: impl Into<String>) {
        let note = note.into();
        info!(
            tag = %self.tag,
            cycle = self.id,
            from = %self.state,
            to = %to,
            "{note}"
        );
        self.record(to, note);
    }

    fn abort(&mut self, outcome: CycleOutcome, detail: impl fmt::Display) -> CycleOutcome {
        let note = format!("{outcome}: {detail}");
        match outcome {
            CycleOutcome::UpToDate => {
                info!(tag = %self.tag, cycle = self.id, from = %self.state, to = %CycleState::Aborted, "{note}")
            }
            CycleOutcome::NetworkUnavailable => {
                warn!(tag = %self.tag, cycle = self.id, from = %self.state, to = %CycleState::Aborted, "{note}")
            }
            _ => {
                error!(tag = %self.tag, cycle = self.id, from = %self.state, to = %CycleState::Aborted, "{note}")
            }
        }
        if outcome != CycleOutcome::UpToDate {
            self.report.error = Some(detail.to_string());
        }
        self.record(CycleState::Aborted, note);
        outcome
    }

    fn record(&mut self, to: CycleState, note: String) {
        self.report.transitions.push(Transition {
            from: self.state,
            to,
            note,
        });
        self.state = to;
    }
}

/// Top-level state machine sequencing the revision source, config preserver,
/// dependency auditor and service controller.
pub struct UpdateOrchestrator {
    source: Arc<dyn RevisionSource>,
    service: Arc<dyn ServiceController>,
    installer: Arc<dyn DependencyInstaller>,
    preserver: ConfigPreserver,
    auditor: DependencyAuditor,
    store: StateStore,
    install_root: PathBuf,
    tag: String,
    metrics: Option<CycleMetrics>,
    cycles: AtomicU64,
}

impl fmt::Debug for UpdateOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateOrchestrator")
            .field("install_root", &self.install_root)
            .field("state", &self.store.path())
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

impl UpdateOrchestrator {
    pub fn new(
        install_root: impl Into<PathBuf>,
        source: Arc<dyn RevisionSource>,
        service: Arc<dyn ServiceController>,
        installer: Arc<dyn DependencyInstaller>,
        preserver: ConfigPreserver,
        auditor: DependencyAuditor,
        store: StateStore,
    ) -> Self {
        Self {
            source,
            service,
            installer,
            preserver,
            auditor,
            store,
            install_root: install_root.into(),
            tag: "bridge-updater".to_owned(),
            metrics: None,
            cycles: AtomicU64::new(0),
        }
    }

    /// Wire the git source, systemd controller and command installer from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, DependencyError> {
        let root = config.install.root.clone();
        let mut preserver = ConfigPreserver::new(config.overlay_path());
        if let Some(template) = &config.overlay.template {
            preserver = preserver.with_template(root.join(template));
        }
        if let Some(holding) = &config.overlay.holding_dir {
            preserver = preserver.with_holding_dir(holding);
        }
        let installer = CommandInstaller::from_config(&root, &config.dependencies)?;
        Ok(Self::new(
            &root,
            Arc::new(GitRevisionSource::new(&root, &config.source)),
            Arc::new(SystemdController::from_config(&config.service)),
            Arc::new(installer),
            preserver,
            DependencyAuditor::new(&config.dependencies.manifest),
            StateStore::new(&config.state.path),
        )
        .with_tag(&config.logging.tag))
    }

    /// Source tag attached to every transition line.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_metrics(mut self, metrics: CycleMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn metrics(&self) -> Option<&CycleMetrics> {
        self.metrics.as_ref()
    }

    /// Number of cycles started by this instance.
    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Committed LocalState, or one seeded in memory from the on-disk tree.
    ///
    /// Nothing is written when seeding.
    async fn installed_state(&self) -> Result<(LocalState, RevisionId), InspectError> {
        let on_disk = self.source.current_local().await?;
        let installed = match self.store.load()? {
            Some(state) => state,
            None => LocalState::seeded(
                on_disk.clone(),
                self.auditor.manifest_hash(&self.install_root)?,
            ),
        };
        Ok((installed, on_disk))
    }

    /// Compare installed and published revisions without changing the tree or LocalState.
    pub async fn inspect(&self) -> Result<Inspection, InspectError> {
        let (installed, on_disk) = self.installed_state().await?;
        let remote = self.source.latest_remote().await?;
        Ok(Inspection {
            installed,
            on_disk,
            remote,
        })
    }

    /// Run one complete cycle from `Checking` to `Idle` or `Aborted`.
    pub async fn run_cycle(&self) -> CycleReport {
        let id = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let mut run = CycleRun::new(id, &self.tag);
        let outcome = self.drive(&mut run).await;
        run.report.outcome = outcome;

        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(outcome.as_str(), started.elapsed().as_secs_f64());
        }
        run.report
    }

    async fn drive(&self, run: &mut CycleRun<'_>) -> CycleOutcome {
        run.advance(CycleState::Checking, "cycle triggered");

        let installed = match self.installed_state().await {
            Ok((installed, _)) => installed,
            Err(InspectError::Source(err)) => {
                return run.abort(CycleOutcome::SourceUnavailable, err)
            }
            Err(err) => return run.abort(CycleOutcome::StateUnavailable, err),
        };
        run.report.installed = Some(installed.revision.clone());

        let remote = match self.source.latest_remote().await {
            Ok(remote) => remote,
            Err(err @ SourceError::NetworkUnavailable(_)) => {
                return run.abort(CycleOutcome::NetworkUnavailable, err)
            }
            Err(err) => return run.abort(CycleOutcome::SourceUnavailable, err),
        };
        run.report.remote = Some(remote.clone());

        if installed.revision == remote {
            return run.abort(
                CycleOutcome::UpToDate,
                format!("installed revision {} is current", remote.short()),
            );
        }

        run.advance(
            CycleState::Updating,
            format!(
                "updating {} -> {}",
                installed.revision.short(),
                remote.short()
            ),
        );
        let snapshot = match self.preserver.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => return run.abort(CycleOutcome::OverlayFailed, err),
        };
        let diff = match self.source.materialize(&remote).await {
            Ok(diff) => diff,
            Err(err) => {
                // The tree may be partially written; put the overlay back anyway.
                if snapshot.is_some() {
                    if let Err(restore_err) = self.preserver.restore(snapshot) {
                        warn!(error = %restore_err, "overlay restore after failed materialize");
                    }
                }
                return run.abort(CycleOutcome::MaterializeFailed, err);
            }
        };
        run.report.changed_paths = Some(diff.len());

        run.advance(
            CycleState::Restoring,
            format!("tree at {}, {} paths changed", remote.short(), diff.len()),
        );
        let restore = match self.preserver.restore(snapshot) {
            Ok(restore) => restore,
            Err(err) => return run.abort(CycleOutcome::OverlayFailed, err),
        };
        let restore_note = match &restore {
            RestoreOutcome::Restored { keys } => format!("overlay restored ({keys} keys)"),
            RestoreOutcome::KeptShipped => "kept overlay shipped by revision".to_owned(),
            RestoreOutcome::Seeded { .. } => "overlay seeded from template".to_owned(),
            RestoreOutcome::Absent => "no overlay to restore".to_owned(),
        };
        run.report.restore = Some(restore);

        run.advance(CycleState::RefreshingDeps, restore_note);
        let manifest_hash = match self.auditor.manifest_hash(&self.install_root) {
            Ok(hash) => hash,
            Err(err) => return run.abort(CycleOutcome::DependencyRefreshFailed, err),
        };
        let reason = self.auditor.refresh_reason(
            &diff,
            installed.manifest_hash.as_deref(),
            manifest_hash.as_deref(),
        );
        let deps_note = match (reason, &manifest_hash) {
            (None, _) => "dependencies unchanged".to_owned(),
            (Some(_), None) => "manifest removed, nothing to install".to_owned(),
            (Some(reason), Some(_)) => {
                run.report.dependency_refresh = Some(reason);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_dependency_refresh();
                }
                if let Err(err) = self.installer.install().await {
                    return run.abort(CycleOutcome::DependencyRefreshFailed, err);
                }
                format!("dependencies refreshed ({})", reason.as_str())
            }
        };

        run.advance(CycleState::Restarting, deps_note);
        let restarted = self.service.restart().await;

        // Single commit point: the tree is correct whether or not the restart worked.
        let committed_at = Utc::now();
        let record = LocalState {
            revision: remote.clone(),
            manifest_hash,
            committed_at: Some(committed_at),
            service_state: Some(match &restarted {
                Ok(state) => *state,
                Err(_) => ServiceState::Failed,
            }),
        };
        if let Err(err) = self.store.commit(&record) {
            return run.abort(CycleOutcome::CommitFailed, err);
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_last_commit(committed_at.timestamp());
        }

        match restarted {
            Ok(state) => {
                run.report.service_state = Some(state);
                run.advance(
                    CycleState::Idle,
                    format!("committed {}, service {state}", remote.short()),
                );
                CycleOutcome::Applied
            }
            Err(err) => {
                run.report.service_state = Some(ServiceState::Failed);
                run.abort(CycleOutcome::ServiceUnhealthy, err)
            }
        }
    }
}
