//! ---
//! bridge_section: "03-testharness"
//! bridge_subsection: "01-bootstrap"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Test harness fakes, fixtures and shared exports."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
//! Scripted stand-ins for the revision source, service controller and
//! dependency installer, plus a throwaway install root, so update cycles can
//! be driven transition by transition without git or systemd.

pub mod capture;
pub mod fakes;
pub mod fixture;

pub use capture::LogCapture;
pub use fakes::{FakeRevisionSource, FakeServiceController, RecordingInstaller};
pub use fixture::{Harness, InstallRoot, LOG_TAG};

/// Route `tracing` output to the test writer; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .try_init();
}
