//! ---
//! bridge_section: "01-common"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Agent configuration model and loader."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Default location of the agent configuration on a device.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/bridge-updater/config.toml";

fn default_install_root() -> PathBuf {
    PathBuf::from("/opt/yarbo-bridge")
}

fn default_remote() -> String {
    "origin".to_owned()
}

fn default_branch() -> String {
    "main".to_owned()
}

fn default_git_binary() -> String {
    "git".to_owned()
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_overlay_file() -> PathBuf {
    PathBuf::from(".env")
}

fn default_overlay_template() -> Option<PathBuf> {
    Some(PathBuf::from(".env.example"))
}

fn default_manifest() -> PathBuf {
    PathBuf::from("requirements.txt")
}

fn default_install_command() -> Vec<String> {
    ["venv/bin/pip", "install", "-r", "requirements.txt"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_install_timeout() -> Duration {
    Duration::from_secs(900)
}

fn default_unit() -> String {
    "yarbo-bridge.service".to_owned()
}

fn default_systemctl() -> String {
    "systemctl".to_owned()
}

fn default_restart_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_schedule_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/bridge-updater/state.json")
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/run/bridge-updater.lock")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("/var/log/bridge-updater")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_log_tag() -> String {
    "yarbo-bridge-update".to_owned()
}

/// Primary configuration object for the updater agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub dependencies: DependencyConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no candidate existed and defaults were used.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "BRIDGE_UPDATER_CONFIG";

    /// Load configuration from disk, respecting the `BRIDGE_UPDATER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit `BRIDGE_UPDATER_CONFIG` path must exist. When none of the
    /// candidates exist the built-in defaults are used, since every field has
    /// a device default.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let candidate = candidate.as_ref();
            if candidate.exists() {
                let config = Self::from_path(candidate)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(candidate.to_path_buf()),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        let config = Self::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    /// Load from `explicit` when given, otherwise through [`Self::load_with_source`].
    ///
    /// An explicit path that does not exist is an error rather than a fall
    /// through to the candidates or the built-in defaults.
    pub fn resolve<P: AsRef<Path>>(
        explicit: Option<&Path>,
        candidates: &[P],
    ) -> Result<LoadedAppConfig> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(anyhow!("config file {} does not exist", path.display()));
                }
                Ok(LoadedAppConfig {
                    config: Self::from_path(path)?,
                    source: Some(path.to_path_buf()),
                })
            }
            None => Self::load_with_source(candidates),
        }
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Absolute path of the device-local overlay file.
    pub fn overlay_path(&self) -> PathBuf {
        self.install.root.join(&self.overlay.file)
    }

    /// Absolute path of the dependency manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.install.root.join(&self.dependencies.manifest)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.overlay.file.is_absolute() {
            return Err(anyhow!(
                "overlay.file must be relative to the install root, got {}",
                self.overlay.file.display()
            ));
        }
        if self.dependencies.manifest.is_absolute() {
            return Err(anyhow!(
                "dependencies.manifest must be relative to the install root, got {}",
                self.dependencies.manifest.display()
            ));
        }
        if self.overlay.file == self.dependencies.manifest {
            return Err(anyhow!(
                "overlay.file and dependencies.manifest must name different files"
            ));
        }
        if self.dependencies.install_command.is_empty() {
            return Err(anyhow!("dependencies.install_command cannot be empty"));
        }
        if self.service.unit.trim().is_empty() {
            return Err(anyhow!("service.unit cannot be empty"));
        }
        if self.schedule.interval.is_zero() {
            return Err(anyhow!("schedule.interval must be greater than zero"));
        }
        if self.service.poll_interval.is_zero() {
            return Err(anyhow!("service.poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_install_root")]
    pub root: PathBuf,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            root: default_install_root(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    /// Upper bound for the remote query; expiry counts as a network failure.
    #[serde(default = "default_fetch_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub fetch_timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: default_branch(),
            git_binary: default_git_binary(),
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Overlay location relative to the install root.
    #[serde(default = "default_overlay_file")]
    pub file: PathBuf,
    /// Template seeded as the overlay when a device has none yet.
    #[serde(default = "default_overlay_template")]
    pub template: Option<PathBuf>,
    /// Directory for the holding copy taken during a swap.
    #[serde(default)]
    pub holding_dir: Option<PathBuf>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            file: default_overlay_file(),
            template: default_overlay_template(),
            holding_dir: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    /// Program and arguments, executed with the install root as working directory.
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
    #[serde(default = "default_install_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            install_command: default_install_command(),
            timeout: default_install_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_systemctl")]
    pub systemctl: String,
    #[serde(default = "default_restart_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub restart_timeout: Duration,
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            unit: default_unit(),
            systemctl: default_systemctl(),
            restart_timeout: default_restart_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_schedule_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    #[serde(default)]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub initial_delay: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: default_schedule_interval(),
            initial_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            lock_path: default_lock_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Source tag attached to every cycle log line.
    #[serde(default = "default_log_tag")]
    pub tag: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            tag: default_log_tag(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus textfile-collector target, rewritten after each cycle.
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}
