//! ---
//! bridge_section: "04-binaries"
//! bridge_subsection: "tests"
//! bridge_type: "source"
//! bridge_scope: "test"
//! bridge_description: "Smoke tests for the updater control CLI."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;

struct Device {
    dir: tempfile::TempDir,
}

impl Device {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        Self { dir }
    }

    fn base(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self, install_root: &Path) -> PathBuf {
        let path = self.base().join("agent.toml");
        let body = format!(
            r#"
[install]
root = "{root}"

[service]
systemctl = "/nonexistent/bridge-updater-systemctl"

[state]
path = "{base}/state.json"
lock_path = "{base}/updater.lock"

[logging]
directory = "{base}/log"
"#,
            root = install_root.display(),
            base = self.base().display(),
        );
        fs::write(&path, body).unwrap();
        path
    }

    fn ctl(&self, config: &Path) -> Command {
        let mut cmd = Command::cargo_bin("bridge-updaterctl").unwrap();
        cmd.env_remove("BRIDGE_UPDATER_CONFIG")
            .arg("--config")
            .arg(config);
        cmd
    }
}

#[test]
fn version_flag_succeeds_without_config() {
    let output = Command::cargo_bin("bridge-updaterctl")
        .unwrap()
        .arg("-V")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("bridge-updater v"));
}

#[test]
fn state_prints_committed_record() {
    let device = Device::new();
    let config = device.config(&device.base().join("app"));
    fs::write(
        device.base().join("state.json"),
        r#"{"revision":"4f1c2a9e","manifest_hash":null,"committed_at":"2026-10-01T08:00:00Z","service_state":"running"}"#,
    )
    .unwrap();

    let output = device.ctl(&config).arg("state").output().unwrap();

    assert!(output.status.success());
    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["revision"], "4f1c2a9e");
    assert_eq!(record["service_state"], "running");
}

#[test]
fn state_without_record_fails() {
    let device = Device::new();
    let config = device.config(&device.base().join("app"));

    let output = device.ctl(&config).arg("state").output().unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no committed state"));
}

#[test]
fn status_reports_overlay_key_count_but_no_values() {
    let device = Device::new();
    let root = device.base().join("app");
    fs::write(root.join(".env"), "YARBO_EMAIL=pi@example.invalid\nHA_TOKEN=abc\n").unwrap();
    let config = device.config(&root);

    let output = device
        .ctl(&config)
        .args(["status", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("pi@example.invalid"));
    let view: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(view["overlay_keys"], 2);
    assert!(view["service"].is_null());
    assert!(view["service_error"].is_string());
    assert!(view["installed"].is_null());
}

#[test]
fn check_against_missing_install_root_fails() {
    let device = Device::new();
    let config = device.config(&device.base().join("absent"));

    let output = device.ctl(&config).arg("check").output().unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("local source tree unavailable"));
}

#[test]
fn check_waits_for_a_running_cycle() {
    let device = Device::new();
    let config = device.config(&device.base().join("app"));
    let mut lock =
        bridge_updater_core::InstanceLock::open(device.base().join("updater.lock")).unwrap();
    let guard = lock.try_acquire().unwrap();

    let output = device.ctl(&config).arg("check").output().unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("another cycle is running"));
    drop(guard);
}

#[test]
fn missing_explicit_config_is_rejected() {
    let device = Device::new();

    let output = device
        .ctl(&device.base().join("agnet.toml"))
        .arg("state")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}
