//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Service controller driving the managed unit through the host supervisor."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bridge_updater_common::config::ServiceConfig;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command;
use crate::error::ServiceError;

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Process state of the managed service as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Stopped,
    Running,
    /// Transient, only seen while a restart is in flight.
    Restarting,
    Failed,
}

impl ServiceState {
    /// Map a systemd `ActiveState` value.
    pub fn from_active_state(value: &str) -> Self {
        match value.trim() {
            "active" => ServiceState::Running,
            "activating" | "reloading" | "deactivating" => ServiceState::Restarting,
            "failed" => ServiceState::Failed,
            _ => ServiceState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Running => "running",
            ServiceState::Restarting => "restarting",
            ServiceState::Failed => "failed",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start/stop/restart/status of the managed long-running process.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Full stop-then-start; resolves once the service is Running again.
    async fn restart(&self) -> Result<ServiceState, ServiceError>;

    /// Non-blocking state query for observability.
    async fn status(&self) -> Result<ServiceState, ServiceError>;
}

/// [`ServiceController`] for a systemd unit.
#[derive(Debug, Clone)]
pub struct SystemdController {
    unit: String,
    systemctl: String,
    restart_timeout: Duration,
    poll_interval: Duration,
}

impl SystemdController {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            unit: config.unit.clone(),
            systemctl: config.systemctl.clone(),
            restart_timeout: config.restart_timeout,
            poll_interval: config.poll_interval,
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    async fn active_state(&self, timeout: Duration) -> Result<ServiceState, ServiceError> {
        // `show` exits 0 for every state, unlike `is-active`.
        let output = command::run(
            &self.systemctl,
            ["show", "--property=ActiveState", "--value", self.unit.as_str()],
            None,
            timeout,
        )
        .await?;
        Ok(ServiceState::from_active_state(output.stdout_trimmed()))
    }
}

#[async_trait]
impl ServiceController for SystemdController {
    async fn restart(&self) -> Result<ServiceState, ServiceError> {
        info!(unit = %self.unit, "restarting service");
        let deadline = Instant::now() + self.restart_timeout;
        command::run(
            &self.systemctl,
            ["restart", self.unit.as_str()],
            None,
            self.restart_timeout,
        )
        .await
        .map_err(|err| ServiceError::RestartFailed {
            unit: self.unit.clone(),
            reason: err.to_string(),
        })?;

        let mut last = ServiceState::Restarting;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            last = self
                .active_state(remaining)
                .await
                .map_err(|err| ServiceError::RestartFailed {
                    unit: self.unit.clone(),
                    reason: err.to_string(),
                })?;
            debug!(unit = %self.unit, state = %last, "polled service state");
            match last {
                ServiceState::Running => {
                    info!(unit = %self.unit, "service running");
                    return Ok(last);
                }
                ServiceState::Failed => break,
                ServiceState::Restarting | ServiceState::Stopped => {
                    tokio::time::sleep(self.poll_interval.min(remaining)).await;
                }
            }
        }
        warn!(unit = %self.unit, state = %last, "service did not reach running");
        Err(ServiceError::RestartFailed {
            unit: self.unit.clone(),
            reason: format!(
                "state {last} after waiting up to {:?}",
                self.restart_timeout
            ),
        })
    }

    async fn status(&self) -> Result<ServiceState, ServiceError> {
        self.active_state(STATUS_TIMEOUT).await
    }
}
