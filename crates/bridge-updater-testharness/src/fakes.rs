//! ---
//! bridge_section: "03-testharness"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Scripted fakes for the cycle collaborators."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bridge_updater_core::{
    CommandError, DependencyError, DependencyInstaller, DiffSet, RevisionId, RevisionSource,
    ServiceController, ServiceError, ServiceState, SourceError,
};
use parking_lot::Mutex;

type RevisionHook = Box<dyn Fn(&RevisionId) + Send + Sync>;
type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct SourceScript {
    /// `None` simulates a missing or corrupt local tree.
    local: Option<RevisionId>,
    /// `None` simulates an unreachable remote.
    remote: Option<RevisionId>,
    diff: DiffSet,
    materialize_failures: VecDeque<String>,
    materialized: Vec<RevisionId>,
}

/// In-memory revision source with scripted identifiers, diffs and failures.
pub struct FakeRevisionSource {
    script: Mutex<SourceScript>,
    on_materialize: Mutex<Option<RevisionHook>>,
    current_local_calls: AtomicUsize,
    latest_remote_calls: AtomicUsize,
    materialize_calls: AtomicUsize,
}

impl FakeRevisionSource {
    pub fn new(local: &str, remote: &str) -> Self {
        Self {
            script: Mutex::new(SourceScript {
                local: Some(RevisionId::new(local)),
                remote: Some(RevisionId::new(remote)),
                diff: DiffSet::default(),
                materialize_failures: VecDeque::new(),
                materialized: Vec::new(),
            }),
            on_materialize: Mutex::new(None),
            current_local_calls: AtomicUsize::new(0),
            latest_remote_calls: AtomicUsize::new(0),
            materialize_calls: AtomicUsize::new(0),
        }
    }

    /// Paths reported by every successful materialize.
    pub fn with_diff<I, P>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.set_diff(paths);
        self
    }

    pub fn set_diff<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.script.lock().diff = paths.into_iter().collect();
    }

    pub fn set_remote(&self, remote: &str) {
        self.script.lock().remote = Some(RevisionId::new(remote));
    }

    pub fn set_network_down(&self) {
        self.script.lock().remote = None;
    }

    pub fn set_local_missing(&self) {
        self.script.lock().local = None;
    }

    /// The next materialize fails with `reason` and leaves the local id untouched.
    pub fn fail_next_materialize(&self, reason: impl Into<String>) {
        self.script.lock().materialize_failures.push_back(reason.into());
    }

    /// Runs inside every successful materialize, before the local id moves;
    /// use it to rewrite files the way a real swap would.
    pub fn on_materialize(&self, hook: impl Fn(&RevisionId) + Send + Sync + 'static) {
        *self.on_materialize.lock() = Some(Box::new(hook));
    }

    pub fn local(&self) -> Option<RevisionId> {
        self.script.lock().local.clone()
    }

    pub fn materialized(&self) -> Vec<RevisionId> {
        self.script.lock().materialized.clone()
    }

    pub fn current_local_calls(&self) -> usize {
        self.current_local_calls.load(Ordering::SeqCst)
    }

    pub fn latest_remote_calls(&self) -> usize {
        self.latest_remote_calls.load(Ordering::SeqCst)
    }

    pub fn materialize_calls(&self) -> usize {
        self.materialize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RevisionSource for FakeRevisionSource {
    async fn current_local(&self) -> Result<RevisionId, SourceError> {
        self.current_local_calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .local
            .clone()
            .ok_or_else(|| SourceError::SourceUnavailable("fake local tree missing".into()))
    }

    async fn latest_remote(&self) -> Result<RevisionId, SourceError> {
        self.latest_remote_calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .remote
            .clone()
            .ok_or_else(|| SourceError::NetworkUnavailable("fake remote unreachable".into()))
    }

    async fn materialize(&self, target: &RevisionId) -> Result<DiffSet, SourceError> {
        self.materialize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.script.lock().materialize_failures.pop_front() {
            return Err(SourceError::MaterializeFailed(reason));
        }
        if let Some(hook) = self.on_materialize.lock().as_ref() {
            hook(target);
        }
        let mut script = self.script.lock();
        script.local = Some(target.clone());
        script.materialized.push(target.clone());
        Ok(script.diff.clone())
    }
}

/// Service controller whose restart results are scripted.
pub struct FakeServiceController {
    state: Mutex<ServiceState>,
    restart_results: Mutex<VecDeque<Result<ServiceState, String>>>,
    on_restart: Mutex<Option<Hook>>,
    restart_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl Default for FakeServiceController {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServiceController {
    /// Starts Running; every restart succeeds unless scripted otherwise.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::Running),
            restart_results: Mutex::new(VecDeque::new()),
            on_restart: Mutex::new(None),
            restart_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_restart(&self, reason: impl Into<String>) {
        self.restart_results.lock().push_back(Err(reason.into()));
    }

    /// Runs at the start of every restart call.
    pub fn on_restart(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_restart.lock() = Some(Box::new(hook));
    }

    pub fn restart_calls(&self) -> usize {
        self.restart_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Total calls of any kind, for asserting the service was left alone.
    pub fn total_calls(&self) -> usize {
        self.restart_calls() + self.status_calls()
    }
}

#[async_trait]
impl ServiceController for FakeServiceController {
    async fn restart(&self) -> Result<ServiceState, ServiceError> {
        self.restart_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_restart.lock().as_ref() {
            hook();
        }
        let result = self
            .restart_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(ServiceState::Running));
        match result {
            Ok(state) => {
                *self.state.lock() = state;
                Ok(state)
            }
            Err(reason) => {
                *self.state.lock() = ServiceState::Failed;
                Err(ServiceError::RestartFailed {
                    unit: "fake-bridge.service".into(),
                    reason,
                })
            }
        }
    }

    async fn status(&self) -> Result<ServiceState, ServiceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.state.lock())
    }
}

/// Dependency installer that records calls instead of running anything.
pub struct RecordingInstaller {
    failures: Mutex<VecDeque<String>>,
    on_install: Mutex<Option<Hook>>,
    calls: AtomicUsize,
}

impl Default for RecordingInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            on_install: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, reason: impl Into<String>) {
        self.failures.lock().push_back(reason.into());
    }

    pub fn on_install(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_install.lock() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DependencyInstaller for RecordingInstaller {
    async fn install(&self) -> Result<(), DependencyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_install.lock().as_ref() {
            hook();
        }
        match self.failures.lock().pop_front() {
            Some(stderr) => Err(DependencyError::Install(CommandError::Failed {
                program: "fake-installer".into(),
                code: Some(1),
                stderr,
            })),
            None => Ok(()),
        }
    }
}
