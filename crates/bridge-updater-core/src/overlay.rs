//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Config preserver keeping the device-local overlay across revision swaps."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::OverlayError;

/// Device-local `key=value` configuration captured before a swap.
///
/// The bytes live in a holding file that is deleted when the value drops.
#[derive(Debug)]
pub struct ConfigOverlay {
    entries: IndexMap<String, String>,
    permissions: fs::Permissions,
    holding: NamedTempFile,
}

impl ConfigOverlay {
    pub fn entries(&self) -> &IndexMap<String, String> {
        &self.entries
    }

    pub fn holding_path(&self) -> &Path {
        self.holding.path()
    }
}

/// What [`ConfigPreserver::restore`] did to the new tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The snapshot was written back over whatever the revision shipped.
    Restored { keys: usize },
    /// No snapshot existed and the revision ships its own overlay.
    KeptShipped,
    /// No overlay anywhere; the template was copied into place.
    Seeded { template: PathBuf },
    /// No snapshot, no shipped overlay, no template.
    Absent,
}

/// Snapshot/restore of the overlay file at a fixed path under the install root.
#[derive(Debug, Clone)]
pub struct ConfigPreserver {
    overlay_path: PathBuf,
    template_path: Option<PathBuf>,
    holding_dir: PathBuf,
}

impl ConfigPreserver {
    pub fn new(overlay_path: impl Into<PathBuf>) -> Self {
        Self {
            overlay_path: overlay_path.into(),
            template_path: None,
            holding_dir: std::env::temp_dir(),
        }
    }

    /// Template copied into place on first run when no overlay exists.
    pub fn with_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template_path = Some(template.into());
        self
    }

    pub fn with_holding_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.holding_dir = dir.into();
        self
    }

    pub fn overlay_path(&self) -> &Path {
        &self.overlay_path
    }

    /// Copy the overlay to the holding location, or `None` when there is none yet.
    pub fn snapshot(&self) -> Result<Option<ConfigOverlay>, OverlayError> {
        let snapshot_err = |source: io::Error| OverlayError::Snapshot {
            path: self.overlay_path.clone(),
            source,
        };
        let bytes = match fs::read(&self.overlay_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.overlay_path.display(), "no overlay present");
                return Ok(None);
            }
            Err(err) => return Err(snapshot_err(err)),
        };
        let permissions = fs::metadata(&self.overlay_path)
            .map_err(snapshot_err)?
            .permissions();

        fs::create_dir_all(&self.holding_dir).map_err(snapshot_err)?;
        let mut holding = tempfile::Builder::new()
            .prefix(".bridge-overlay-")
            .tempfile_in(&self.holding_dir)
            .map_err(snapshot_err)?;
        holding.write_all(&bytes).map_err(snapshot_err)?;
        holding.as_file().sync_all().map_err(snapshot_err)?;

        let entries = parse_overlay(&String::from_utf8_lossy(&bytes));
        info!(keys = entries.len(), "overlay snapshot taken");
        Ok(Some(ConfigOverlay {
            entries,
            permissions,
            holding,
        }))
    }

    /// Put the overlay back into a freshly materialized tree.
    ///
    /// The snapshot is consumed so its holding copy is removed on every path
    /// out of this function.
    pub fn restore(&self, snapshot: Option<ConfigOverlay>) -> Result<RestoreOutcome, OverlayError> {
        let restore_err = |source: io::Error| OverlayError::Restore {
            path: self.overlay_path.clone(),
            source,
        };
        match snapshot {
            Some(overlay) => {
                let bytes = fs::read(overlay.holding_path()).map_err(restore_err)?;
                write_replacing(&self.overlay_path, &bytes, Some(&overlay.permissions))
                    .map_err(restore_err)?;
                let keys = overlay.entries.len();
                info!(keys, "overlay restored");
                Ok(RestoreOutcome::Restored { keys })
            }
            None if self.overlay_path.exists() => {
                debug!("revision ships its own overlay; leaving it untouched");
                Ok(RestoreOutcome::KeptShipped)
            }
            None => match &self.template_path {
                Some(template) if template.is_file() => {
                    let bytes = fs::read(template).map_err(restore_err)?;
                    write_replacing(&self.overlay_path, &bytes, None).map_err(restore_err)?;
                    info!(template = %template.display(), "overlay seeded from template");
                    Ok(RestoreOutcome::Seeded {
                        template: template.clone(),
                    })
                }
                _ => Ok(RestoreOutcome::Absent),
            },
        }
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename.
fn write_replacing(path: &Path, bytes: &[u8], permissions: Option<&fs::Permissions>) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut staged = tempfile::Builder::new()
        .prefix(".bridge-overlay-")
        .tempfile_in(parent)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    if let Some(permissions) = permissions {
        fs::set_permissions(staged.path(), permissions.clone())?;
    }
    staged.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Parse the overlay's `key=value` lines.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is allowed
/// and matching single or double quotes around the value are stripped.
/// Later duplicates win.
pub fn parse_overlay(text: &str) -> IndexMap<String, String> {
    let mut entries = IndexMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        entries.insert(key.to_owned(), unquote(value.trim()).to_owned());
    }
    entries
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    const OVERLAY: &str = "# device secrets\nYARBO_EMAIL=pi@example.invalid\nexport YARBO_ROBOT_IP=\"192.168.68.102\"\n\nHA_TOKEN='abc=def'\n";

    fn preserver(root: &Path) -> ConfigPreserver {
        ConfigPreserver::new(root.join(".env")).with_holding_dir(root.join("holding"))
    }

    #[test]
    fn parses_comments_exports_and_quotes() {
        let entries = parse_overlay(OVERLAY);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries["YARBO_EMAIL"], "pi@example.invalid");
        assert_eq!(entries["YARBO_ROBOT_IP"], "192.168.68.102");
        assert_eq!(entries["HA_TOKEN"], "abc=def");
    }

    #[test]
    fn snapshot_of_missing_overlay_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(preserver(dir.path()).snapshot().unwrap().is_none());
    }

    #[test]
    fn restore_overwrites_shipped_overlay_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let preserver = preserver(dir.path());
        fs::write(preserver.overlay_path(), OVERLAY).unwrap();

        let snapshot = preserver.snapshot().unwrap().unwrap();
        let holding = snapshot.holding_path().to_path_buf();
        assert!(holding.exists());

        fs::write(preserver.overlay_path(), "SHIPPED=1\n").unwrap();
        let outcome = preserver.restore(Some(snapshot)).unwrap();

        assert_eq!(outcome, RestoreOutcome::Restored { keys: 3 });
        assert_eq!(fs::read_to_string(preserver.overlay_path()).unwrap(), OVERLAY);
        assert!(!holding.exists(), "holding copy must be removed");
    }

    #[test]
    fn holding_copy_is_removed_when_restore_fails() {
        let dir = tempfile::tempdir().unwrap();
        let preserver = preserver(dir.path());
        fs::write(preserver.overlay_path(), OVERLAY).unwrap();
        let snapshot = preserver.snapshot().unwrap().unwrap();
        let holding = snapshot.holding_path().to_path_buf();

        // A directory where the overlay file should go makes the rename fail.
        fs::remove_file(preserver.overlay_path()).unwrap();
        fs::create_dir(preserver.overlay_path()).unwrap();
        fs::write(preserver.overlay_path().join("occupied"), "x").unwrap();

        assert!(preserver.restore(Some(snapshot)).is_err());
        assert!(!holding.exists());
    }

    #[test]
    fn no_snapshot_keeps_shipped_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let preserver = preserver(dir.path());
        fs::write(preserver.overlay_path(), "SHIPPED=1\n").unwrap();
        assert_eq!(preserver.restore(None).unwrap(), RestoreOutcome::KeptShipped);
        assert_eq!(
            fs::read_to_string(preserver.overlay_path()).unwrap(),
            "SHIPPED=1\n"
        );
    }

    #[test]
    fn first_run_seeds_from_template() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join(".env.example");
        fs::write(&template, "YARBO_EMAIL=\n").unwrap();
        let preserver = preserver(dir.path()).with_template(&template);

        let outcome = preserver.restore(None).unwrap();
        assert_eq!(outcome, RestoreOutcome::Seeded { template });
        assert_eq!(
            fs::read_to_string(preserver.overlay_path()).unwrap(),
            "YARBO_EMAIL=\n"
        );
    }

    #[test]
    fn nothing_to_restore_or_seed_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let preserver = preserver(dir.path()).with_template(dir.path().join("missing"));
        assert_eq!(preserver.restore(None).unwrap(), RestoreOutcome::Absent);
        assert!(!preserver.overlay_path().exists());
    }
}
