//! Running the OS inspection tools (`ps`, `lsof`, `ss`) that the probes
//! read from. A missing tool is never fatal: callers log it and treat the
//! probe as having found nothing.

use std::io;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{tool} is not available")]
    Unavailable { tool: String },
    #[error("{tool} failed: {source}")]
    Failed { tool: String, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Pid of the tool itself, so a matcher can leave it out.
    pub pid: Option<u32>,
    pub success: bool,
    pub stdout: String,
}

pub async fn run_tool(program: &str, args: &[&str]) -> Result<ToolOutput, ProbeError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ProbeError::Unavailable {
                tool: program.to_string(),
            },
            _ => ProbeError::Failed {
                tool: program.to_string(),
                source: e,
            },
        })?;

    let pid = child.id();
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ProbeError::Failed {
            tool: program.to_string(),
            source: e,
        })?;

    Ok(ToolOutput {
        pid,
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

/// Run the first candidate that exists. Tools live in `sbin` on some
/// systems, which is not always on an unprivileged user's PATH.
pub async fn run_first(candidates: &[&str], args: &[&str]) -> Result<ToolOutput, ProbeError> {
    let mut last = None;
    for program in candidates {
        match run_tool(program, args).await {
            Err(e @ ProbeError::Unavailable { .. }) => {
                tracing::trace!("{e}");
                last = Some(e);
            }
            other => return other,
        }
    }
    Err(last.unwrap_or_else(|| ProbeError::Unavailable {
        tool: candidates.join("|"),
    }))
}
