//! ---
//! bridge_section: "04-binaries"
//! bridge_subsection: "binary"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Read-only status, check and state commands."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bridge_updater_common::config::{AppConfig, DEFAULT_CONFIG_PATH};
use bridge_updater_core::{
    parse_overlay, InstanceLock, LocalState, LockError, ServiceController, ServiceState,
    StateStore, SystemdController, UpdateOrchestrator,
};
use serde::Serialize;
use tokio::runtime::Runtime;

#[derive(Debug, Serialize)]
struct StatusView {
    unit: String,
    service: Option<ServiceState>,
    service_error: Option<String>,
    installed: Option<LocalState>,
    /// Only the number of keys; values are device secrets.
    overlay_keys: Option<usize>,
}

pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let candidates = [
        PathBuf::from(DEFAULT_CONFIG_PATH),
        PathBuf::from("configs/example.toml"),
    ];
    Ok(AppConfig::resolve(explicit, &candidates)?.config)
}

pub fn status(config: &AppConfig, json: bool) -> Result<()> {
    let runtime = Runtime::new()?;
    let controller = SystemdController::from_config(&config.service);
    let (service, service_error) = match runtime.block_on(controller.status()) {
        Ok(state) => (Some(state), None),
        Err(err) => (None, Some(err.to_string())),
    };
    let installed = StateStore::new(&config.state.path).load()?;
    let overlay_keys = fs::read_to_string(config.overlay_path())
        .ok()
        .map(|text| parse_overlay(&text).len());
    let view = StatusView {
        unit: config.service.unit.clone(),
        service,
        service_error,
        installed,
        overlay_keys,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    let service = match (&view.service, &view.service_error) {
        (Some(state), _) => state.to_string(),
        (None, Some(err)) => format!("unknown ({err})"),
        (None, None) => "unknown".to_owned(),
    };
    println!("Unit: {}\nService: {}", view.unit, service);
    match &view.installed {
        Some(state) => println!(
            "Installed: {}\nCommitted: {}",
            state.revision,
            state
                .committed_at
                .map_or_else(|| "never".to_owned(), |at| at.to_rfc3339())
        ),
        None => println!("Installed: no committed state"),
    }
    match view.overlay_keys {
        Some(keys) => println!("Overlay: {} ({keys} keys)", config.overlay_path().display()),
        None => println!("Overlay: absent"),
    }
    Ok(())
}

/// Fetches the remote and compares; the tree and LocalState are left alone.
///
/// The fetch rewrites `FETCH_HEAD`, so it runs under the instance lock to stay
/// out of a running cycle's way.
pub fn check(config: &AppConfig) -> Result<()> {
    let mut lock = InstanceLock::open(&config.state.lock_path)?;
    let _guard = match lock.try_acquire() {
        Ok(guard) => guard,
        Err(LockError::AlreadyRunning(path)) => {
            bail!("another cycle is running (lock {}); try again later", path.display())
        }
        Err(err) => return Err(err.into()),
    };
    let orchestrator = UpdateOrchestrator::from_config(config)?;
    let runtime = Runtime::new()?;
    let inspection = runtime
        .block_on(orchestrator.inspect())
        .context("update check failed")?;
    println!(
        "Installed: {}\nOn disk: {}\nRemote: {}\nUpdate Available: {}",
        inspection.installed.revision,
        inspection.on_disk,
        inspection.remote,
        inspection.update_available()
    );
    Ok(())
}

pub fn state(config: &AppConfig) -> Result<()> {
    let store = StateStore::new(&config.state.path);
    let Some(state) = store.load()? else {
        bail!("no committed state at {}", store.path().display());
    };
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
