//! Subprocess plumbing shared by the tool wrappers.

use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::debug;

use clip_core::{ClipError, Result};

/// Run a tool to completion, mapping spawn failures and non-zero exits to
/// collaborator errors. The child is killed if the future is dropped, so a
/// unit timeout does not leave it running.
pub(crate) async fn run(tool: &'static str, cmd: &mut Command) -> Result<Output> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    debug!(tool, "Running {:?}", cmd.as_std());

    let output = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ClipError::collaborator(tool, format!("binary not found: {}", program))
            } else {
                ClipError::collaborator(tool, format!("failed to start {}: {}", program, e))
            }
        })?;

    if !output.status.success() {
        return Err(ClipError::collaborator(
            tool,
            format!(
                "{} exited with {}: {}",
                program,
                output.status,
                tail(&output.stderr)
            ),
        ));
    }

    Ok(output)
}

/// Last few lines of a tool's stderr, enough to diagnose a failure.
pub(crate) fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}
