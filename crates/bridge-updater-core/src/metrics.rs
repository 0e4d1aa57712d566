//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Cycle metrics and Prometheus textfile export."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Shared registry type used across the agent.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Metrics recorded by the update orchestrator.
#[derive(Clone, Debug)]
pub struct CycleMetrics {
    registry: SharedRegistry,
    cycles: IntCounterVec,
    dependency_refreshes: IntCounter,
    last_commit: Gauge,
    cycle_seconds: Histogram,
}

impl CycleMetrics {
    pub fn new(registry: SharedRegistry) -> prometheus::Result<Self> {
        let cycles = IntCounterVec::new(
            Opts::new(
                "bridge_updater_cycles_total",
                "Completed update cycles by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(cycles.clone()))?;

        let dependency_refreshes = IntCounter::with_opts(Opts::new(
            "bridge_updater_dependency_refresh_total",
            "Dependency installs started by the orchestrator",
        ))?;
        registry.register(Box::new(dependency_refreshes.clone()))?;

        let last_commit = Gauge::with_opts(Opts::new(
            "bridge_updater_last_commit_timestamp_seconds",
            "Unix time of the last LocalState commit",
        ))?;
        registry.register(Box::new(last_commit.clone()))?;

        let cycle_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "bridge_updater_cycle_duration_seconds",
                "Wall time of one update cycle",
            )
            .buckets(prometheus::exponential_buckets(0.05, 2.0, 14)?),
        )?;
        registry.register(Box::new(cycle_seconds.clone()))?;

        Ok(Self {
            registry,
            cycles,
            dependency_refreshes,
            last_commit,
            cycle_seconds,
        })
    }

    /// Metrics bound to a private registry, for callers without an exporter.
    pub fn unregistered() -> prometheus::Result<Self> {
        Self::new(new_registry())
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_cycle(&self, outcome: &str, seconds: f64) {
        self.cycles.with_label_values(&[outcome]).inc();
        self.cycle_seconds.observe(seconds);
    }

    pub fn cycles(&self, outcome: &str) -> u64 {
        self.cycles.with_label_values(&[outcome]).get()
    }

    pub fn inc_dependency_refresh(&self) {
        self.dependency_refreshes.inc();
    }

    pub fn dependency_refreshes(&self) -> u64 {
        self.dependency_refreshes.get()
    }

    pub fn set_last_commit(&self, unix_seconds: i64) {
        self.last_commit.set(unix_seconds as f64);
    }

    /// Text exposition of everything in the registry.
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    /// Atomically rewrite a node-exporter textfile collector file.
    pub fn write_textfile(&self, path: &Path) -> io::Result<()> {
        let body = self
            .render()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut staged = tempfile::Builder::new()
            .prefix(".bridge-updater-")
            .suffix(".prom")
            .tempfile_in(parent)?;
        staged.write_all(body.as_bytes())?;
        staged.persist(path).map_err(|err| err.error)?;
        Ok(())
    }
}
