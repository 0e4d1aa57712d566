//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "tests"
//! bridge_type: "source"
//! bridge_scope: "test"
//! bridge_description: "Cycle transition tests against scripted collaborators."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fs;
use std::sync::Arc;

use bridge_updater_core::{
    CycleMetrics, CycleOutcome, CycleState, LocalState, RefreshReason, RestoreOutcome,
    RevisionId, ServiceState,
};
use bridge_updater_testharness::{init_test_tracing, Harness, LogCapture, LOG_TAG};
use parking_lot::Mutex;

const OVERLAY: &[u8] = b"YARBO_EMAIL=pi@example.invalid\nHA_TOKEN='s3cr=t'\n# keep me\n";

fn commit(harness: &Harness, revision: &str, manifest: Option<&[u8]>) {
    let hash = manifest.map(|bytes| {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(bytes))
    });
    let mut state = LocalState::seeded(RevisionId::new(revision), hash);
    state.committed_at = Some(chrono::Utc::now());
    harness.store().commit(&state).unwrap();
}

#[tokio::test]
async fn equal_revisions_abort_without_touching_anything() {
    init_test_tracing();
    let harness = Harness::new("B", "B").unwrap();
    harness.root.write(".env", OVERLAY).unwrap();
    harness.root.write("requirements.txt", "paho-mqtt==2.1.0\n").unwrap();
    let before = harness.root.tree().unwrap();

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::UpToDate);
    assert_eq!(report.outcome.exit_code(), 0);
    assert_eq!(report.final_state(), CycleState::Aborted);
    assert_eq!(harness.root.tree().unwrap(), before);
    assert_eq!(harness.source.materialize_calls(), 0);
    assert_eq!(harness.service.total_calls(), 0);
    assert_eq!(harness.installer.calls(), 0);
    assert!(harness.committed().is_none());
}

#[tokio::test]
async fn new_revision_without_overlay_restarts_once_and_commits() {
    init_test_tracing();
    let harness = Harness::new("A", "B").unwrap();
    harness.source.set_diff(["app.py"]);
    harness.root.write("requirements.txt", "paho-mqtt==2.1.0\n").unwrap();

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Applied);
    assert_eq!(report.final_state(), CycleState::Idle);
    let committed = harness.committed().unwrap();
    assert_eq!(committed.revision, RevisionId::new("B"));
    assert_eq!(committed.service_state, Some(ServiceState::Running));
    assert_eq!(harness.installer.calls(), 0);
    assert_eq!(harness.service.restart_calls(), 1);

    let path: Vec<_> = report.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![
            CycleState::Checking,
            CycleState::Updating,
            CycleState::Restoring,
            CycleState::RefreshingDeps,
            CycleState::Restarting,
            CycleState::Idle,
        ]
    );
    assert_eq!(report.restore, Some(RestoreOutcome::Absent));
}

#[tokio::test]
async fn every_transition_emits_one_tagged_line() {
    let capture = LogCapture::new();
    let _subscriber = capture.set_default();
    let harness = Harness::new("A", "B").unwrap();
    harness.source.set_diff(["app.py"]);

    let report = harness.orchestrator().run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Applied);

    let lines: Vec<String> = capture
        .lines()
        .into_iter()
        .filter(|line| line.contains(" from="))
        .collect();
    let expected = [
        ("idle", "checking"),
        ("checking", "updating"),
        ("updating", "restoring"),
        ("restoring", "refreshing-deps"),
        ("refreshing-deps", "restarting"),
        ("restarting", "idle"),
    ];
    assert_eq!(lines.len(), expected.len(), "{lines:#?}");
    for (line, (from, to)) in lines.iter().zip(expected) {
        assert!(line.contains(&format!("tag={LOG_TAG} ")), "{line}");
        assert!(line.contains(" cycle=1 "), "{line}");
        assert!(line.contains(&format!(" from={from} ")), "{line}");
        assert!(line.contains(&format!(" to={to}")), "{line}");
    }
}

#[tokio::test]
async fn aborted_cycle_logs_terminal_line_once() {
    let capture = LogCapture::new();
    let _subscriber = capture.set_default();
    let harness = Harness::new("B", "B").unwrap();

    let report = harness.orchestrator().run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::UpToDate);

    let terminal: Vec<String> = capture
        .lines()
        .into_iter()
        .filter(|line| line.contains(" to=aborted"))
        .collect();
    assert_eq!(terminal.len(), 1, "{terminal:#?}");
    assert!(terminal[0].contains(&format!("tag={LOG_TAG} ")));
    assert!(terminal[0].contains(" from=checking "));
}

#[tokio::test]
async fn overlay_is_byte_identical_after_tree_is_overwritten() {
    init_test_tracing();
    let harness = Harness::new("A", "B").unwrap();
    harness.root.write(".env", OVERLAY).unwrap();
    let root = harness.root.root();
    harness.source.set_diff(["app.py", ".env"]);
    harness.source.on_materialize(move |_| {
        fs::write(root.join(".env"), "SHIPPED_DEFAULT=1\n").unwrap();
        fs::write(root.join("app.py"), "print('v2')\n").unwrap();
    });

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Applied);
    assert_eq!(harness.root.read(".env").unwrap(), OVERLAY);
    assert_eq!(report.restore, Some(RestoreOutcome::Restored { keys: 2 }));
    let holding = harness.root.holding_dir();
    let leftovers = fs::read_dir(&holding).map(|dir| dir.count()).unwrap_or(0);
    assert_eq!(leftovers, 0, "holding copy must not outlive the cycle");
}

#[tokio::test]
async fn source_only_change_skips_dependency_refresh() {
    let harness = Harness::new("A", "B").unwrap();
    harness.root.write("requirements.txt", "paho-mqtt==2.1.0\n").unwrap();
    harness.source.set_diff(["app.py"]);

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Applied);
    assert_eq!(harness.installer.calls(), 0);
    assert_eq!(report.dependency_refresh, None);
}

#[tokio::test]
async fn manifest_change_triggers_dependency_refresh() {
    let harness = Harness::new("A", "B").unwrap();
    harness.root.write("requirements.txt", "paho-mqtt==2.1.0\n").unwrap();
    harness.source.set_diff(["requirements.txt"]);
    let root = harness.root.root();
    harness.source.on_materialize(move |_| {
        fs::write(root.join("requirements.txt"), "paho-mqtt==2.1.0\nrequests\n").unwrap();
    });

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Applied);
    assert_eq!(harness.installer.calls(), 1);
    assert_eq!(report.dependency_refresh, Some(RefreshReason::ManifestChanged));
    let committed = harness.committed().unwrap();
    assert_eq!(
        committed.manifest_hash,
        Some(hex_sha256(b"paho-mqtt==2.1.0\nrequests\n"))
    );
}

#[tokio::test]
async fn local_state_only_moves_after_restart() {
    init_test_tracing();
    let harness = Harness::new("A", "B").unwrap();
    harness.root.write("requirements.txt", "a\n").unwrap();
    commit(&harness, "A", Some(b"a\n"));
    harness.source.set_diff(["requirements.txt"]);

    let seen: Arc<Mutex<Vec<(&'static str, RevisionId)>>> = Arc::default();
    let observe = |step: &'static str| {
        let store = harness.store();
        let seen = seen.clone();
        move || {
            let revision = store.load().unwrap().unwrap().revision;
            seen.lock().push((step, revision));
        }
    };
    let on_materialize = observe("materialize");
    harness.source.on_materialize(move |_| on_materialize());
    harness.installer.on_install(observe("install"));
    harness.service.on_restart(observe("restart"));

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Applied);
    let seen = seen.lock().clone();
    assert_eq!(
        seen,
        vec![
            ("materialize", RevisionId::new("A")),
            ("install", RevisionId::new("A")),
            ("restart", RevisionId::new("A")),
        ]
    );
    assert_eq!(harness.committed().unwrap().revision, RevisionId::new("B"));
}

#[tokio::test]
async fn failed_materialize_is_retried_by_the_next_cycle() {
    let harness = Harness::new("A", "B").unwrap();
    harness.root.write(".env", OVERLAY).unwrap();
    commit(&harness, "A", None);
    harness.source.fail_next_materialize("disk full");
    let orchestrator = harness.orchestrator();

    let first = orchestrator.run_cycle().await;
    assert_eq!(first.outcome, CycleOutcome::MaterializeFailed);
    assert_eq!(first.outcome.exit_code(), 1);
    assert_eq!(first.error.as_deref(), Some("materialize failed: disk full"));
    assert_eq!(harness.committed().unwrap().revision, RevisionId::new("A"));
    assert_eq!(harness.service.restart_calls(), 0);
    assert_eq!(harness.root.read(".env").unwrap(), OVERLAY);

    let second = orchestrator.run_cycle().await;
    assert_eq!(second.outcome, CycleOutcome::Applied);
    assert_eq!(second.cycle, 2);
    assert_eq!(harness.source.materialize_calls(), 2);
    assert_eq!(harness.source.materialized(), vec![RevisionId::new("B")]);
    assert_eq!(harness.committed().unwrap().revision, RevisionId::new("B"));
    assert_eq!(harness.service.restart_calls(), 1);
}

#[tokio::test]
async fn unreachable_remote_is_a_clean_abort() {
    let harness = Harness::new("A", "B").unwrap();
    harness.source.set_network_down();

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::NetworkUnavailable);
    assert_eq!(report.outcome.exit_code(), 0);
    assert_eq!(report.final_state(), CycleState::Aborted);
    assert_eq!(harness.source.materialize_calls(), 0);
    assert_eq!(harness.service.total_calls(), 0);
}

#[tokio::test]
async fn failed_install_keeps_old_state_and_next_cycle_reinstalls() {
    let harness = Harness::new("A", "B").unwrap();
    harness.root.write("requirements.txt", "old\n").unwrap();
    commit(&harness, "A", Some(b"old\n"));
    harness.source.set_diff(["requirements.txt"]);
    let root = harness.root.root();
    harness.source.on_materialize(move |_| {
        fs::write(root.join("requirements.txt"), "new\n").unwrap();
    });
    harness.installer.fail_next("no network for pip");
    let orchestrator = harness.orchestrator();

    let first = orchestrator.run_cycle().await;
    assert_eq!(first.outcome, CycleOutcome::DependencyRefreshFailed);
    assert_eq!(first.outcome.exit_code(), 1);
    assert_eq!(harness.committed().unwrap().revision, RevisionId::new("A"));
    assert_eq!(harness.service.restart_calls(), 0);

    // The tree already sits at B, so the diff no longer names the manifest.
    harness.source.set_diff(std::iter::empty::<&str>());
    let second = orchestrator.run_cycle().await;
    assert_eq!(second.outcome, CycleOutcome::Applied);
    assert_eq!(
        second.dependency_refresh,
        Some(RefreshReason::InstalledManifestStale)
    );
    assert_eq!(harness.installer.calls(), 2);
    let committed = harness.committed().unwrap();
    assert_eq!(committed.revision, RevisionId::new("B"));
    assert_eq!(committed.manifest_hash, Some(hex_sha256(b"new\n")));
}

#[tokio::test]
async fn failed_restart_commits_and_reports_service_health() {
    let harness = Harness::new("A", "B").unwrap();
    harness.service.fail_next_restart("unit entered failed state");

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::ServiceUnhealthy);
    assert_eq!(report.outcome.exit_code(), 2);
    assert_eq!(report.final_state(), CycleState::Aborted);
    let committed = harness.committed().unwrap();
    assert_eq!(committed.revision, RevisionId::new("B"));
    assert_eq!(committed.service_state, Some(ServiceState::Failed));
}

#[tokio::test]
async fn missing_local_tree_aborts_before_querying_remote() {
    let harness = Harness::new("A", "B").unwrap();
    harness.source.set_local_missing();

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::SourceUnavailable);
    assert_eq!(report.outcome.exit_code(), 3);
    assert_eq!(harness.source.latest_remote_calls(), 0);
}

#[tokio::test]
async fn corrupt_state_record_is_state_unavailable() {
    let harness = Harness::new("A", "B").unwrap();
    let path = harness.root.state_path();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "{ truncated").unwrap();

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::StateUnavailable);
    assert_eq!(harness.source.materialize_calls(), 0);
}

#[tokio::test]
async fn first_run_seeds_overlay_from_template() {
    let harness = Harness::new("A", "B").unwrap();
    harness.root.write(".env.example", "YARBO_EMAIL=\n").unwrap();

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Applied);
    assert!(matches!(report.restore, Some(RestoreOutcome::Seeded { .. })));
    assert_eq!(harness.root.read_string(".env").unwrap(), "YARBO_EMAIL=\n");
}

#[tokio::test]
async fn committed_revision_is_the_comparison_baseline() {
    // Tree already at B (earlier failed cycle) but LocalState still says A.
    let harness = Harness::new("B", "B").unwrap();
    commit(&harness, "A", None);

    let report = harness.orchestrator().run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Applied);
    assert_eq!(report.installed, Some(RevisionId::new("A")));
    assert_eq!(harness.committed().unwrap().revision, RevisionId::new("B"));
}

#[tokio::test]
async fn metrics_count_outcomes_and_refreshes() {
    let harness = Harness::new("A", "B").unwrap();
    harness.root.write("requirements.txt", "x\n").unwrap();
    harness.source.set_diff(["requirements.txt"]);
    let metrics = CycleMetrics::unregistered().unwrap();
    let orchestrator = harness.orchestrator().with_metrics(metrics.clone());

    orchestrator.run_cycle().await;
    orchestrator.run_cycle().await;

    assert_eq!(metrics.cycles("applied"), 1);
    assert_eq!(metrics.cycles("up-to-date"), 1);
    assert_eq!(metrics.dependency_refreshes(), 1);
    assert_eq!(orchestrator.cycles_started(), 2);
}

#[tokio::test]
async fn inspect_reports_without_mutation() {
    let harness = Harness::new("A", "C").unwrap();
    harness.root.write(".env", OVERLAY).unwrap();
    let before = harness.root.tree().unwrap();

    let inspection = harness.orchestrator().inspect().await.unwrap();

    assert!(inspection.update_available());
    assert_eq!(inspection.installed.revision, RevisionId::new("A"));
    assert!(!inspection.installed.is_committed());
    assert_eq!(inspection.remote, RevisionId::new("C"));
    assert_eq!(harness.root.tree().unwrap(), before);
    assert_eq!(harness.source.materialize_calls(), 0);
}

fn hex_sha256(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
