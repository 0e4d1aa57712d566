//! ---
//! bridge_section: "04-binaries"
//! bridge_subsection: "tests"
//! bridge_type: "source"
//! bridge_scope: "test"
//! bridge_description: "Smoke tests for the updater agent binary."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;

fn write_config(dir: &Path, install_root: &Path) -> PathBuf {
    let path = dir.join("agent.toml");
    let body = format!(
        r#"
[install]
root = "{root}"

[state]
path = "{base}/state/state.json"
lock_path = "{base}/run/updater.lock"

[logging]
directory = "{base}/log"

[metrics]
textfile = "{base}/metrics/bridge_updater.prom"
"#,
        root = install_root.display(),
        base = dir.display(),
    );
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn version_flag_prints_build_metadata() {
    let output = Command::cargo_bin("bridge-updaterd")
        .unwrap()
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("bridge-updater v"));
}

fn daemon() -> Command {
    let mut cmd = Command::cargo_bin("bridge-updaterd").unwrap();
    cmd.env_remove("BRIDGE_UPDATER_CONFIG")
        .env_remove("BRIDGE_UPDATER_LOG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn cycle_json_report_is_the_only_stdout_content() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &dir.path().join("absent"));

    let output = daemon()
        .args(["--config", config.to_str().unwrap(), "cycle", "--json"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(3));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["outcome"], "source-unavailable");
    assert_eq!(report["transitions"].as_array().map(Vec::len), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("to=aborted"));
    assert!(!dir.path().join("state/state.json").exists());
    let metrics = fs::read_to_string(dir.path().join("metrics/bridge_updater.prom")).unwrap();
    assert!(metrics.contains("outcome=\"source-unavailable\""));
}

#[test]
fn cycle_flushes_terminal_state_line_before_exit() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &dir.path().join("absent"));

    for _ in 0..5 {
        let output = daemon()
            .args(["--config", config.to_str().unwrap(), "cycle"])
            .output()
            .unwrap();

        assert_eq!(output.status.code(), Some(3));
        let stdout = String::from_utf8_lossy(&output.stdout);
        let terminal = stdout
            .lines()
            .find(|line| line.contains("to=aborted"))
            .unwrap_or_else(|| panic!("no terminal line in {stdout:?}"));
        assert!(terminal.contains("tag=yarbo-bridge-update"));
        assert!(terminal.contains("from=checking"));
        assert!(!stdout.contains('\x1b'), "piped output must not carry ANSI escapes");
    }

    let logs: String = fs::read_dir(dir.path().join("log"))
        .unwrap()
        .map(|entry| fs::read_to_string(entry.unwrap().path()).unwrap())
        .collect();
    assert_eq!(logs.matches("to=aborted").count(), 5);
}

#[test]
fn missing_explicit_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let output = daemon()
        .args(["--config", dir.path().join("agnet.toml").to_str().unwrap(), "cycle"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
    assert!(!dir.path().join("log").exists());
}

#[test]
fn invalid_config_fails_before_any_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bad.toml");
    fs::write(&config, "[schedule]\ninterval = 0\n").unwrap();

    daemon()
        .args(["--config", config.to_str().unwrap(), "cycle"])
        .assert()
        .failure();
}
