//! ---
//! bridge_section: "01-common"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Shared primitives for the updater agent binaries."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
//! Shared configuration loading, tracing initialisation and version
//! metadata consumed by the agent and its control CLI.

pub mod config;
pub mod logging;
pub mod version;

pub use config::{
    AppConfig, DependencyConfig, InstallConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
    OverlayConfig, ScheduleConfig, ServiceConfig, SourceConfig, StateConfig, DEFAULT_CONFIG_PATH,
};
pub use logging::{init_console, init_tracing, ConsoleTarget, LogFormat, LogGuard};
pub use version::VersionInfo;
