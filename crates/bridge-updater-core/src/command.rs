//! ---
//! bridge_section: "02-core"
//! bridge_subsection: "module"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Bounded subprocess execution shared by git, systemctl and installers."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::CommandError;

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout with the trailing newline removed.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim_end_matches(['\r', '\n'])
    }
}

/// Run `program` with `args` in `cwd`, killing it once `timeout` elapses.
///
/// A non-zero exit status is reported as [`CommandError::Failed`] carrying the
/// captured stderr.
pub async fn run(
    program: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let program_name = program.as_ref().to_string_lossy().into_owned();
    let mut command = Command::new(program.as_ref());
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let child = command.spawn().map_err(|source| CommandError::Spawn {
        program: program_name.clone(),
        source,
    })?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| CommandError::Spawn {
            program: program_name.clone(),
            source,
        })?,
        Err(_) => {
            return Err(CommandError::Timeout {
                program: program_name,
                timeout,
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    debug!(
        program = %program_name,
        status = ?output.status.code(),
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "command finished"
    );
    if !output.status.success() {
        return Err(CommandError::Failed {
            program: program_name,
            code: output.status.code(),
            stderr: stderr.trim().to_owned(),
        });
    }
    Ok(CommandOutput { stdout, stderr })
}
