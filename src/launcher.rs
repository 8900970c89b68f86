use crate::config::WorkerSpec;
use crate::sys;
use serde::Serialize;
use std::fs::OpenOptions;
use std::future::Future;
use std::io;
use std::process::Stdio;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to start '{program}': {source}")]
    Spawn { program: String, source: io::Error },
    #[error("failed to open worker log '{path}': {source}")]
    Log { path: String, source: io::Error },
    #[error("worker exited during startup ({status})")]
    ExitedEarly { status: String },
    #[error("failed to wait for worker: {0}")]
    Wait(io::Error),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// Leave the worker running in its own process group.
    #[default]
    Detached,
    /// Wait for the worker to exit.
    Foreground,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Running { pid: u32 },
    Exited { pid: u32, code: Option<i32> },
}

pub trait Launcher {
    fn launch(
        &self,
        spec: &WorkerSpec,
        mode: LaunchMode,
    ) -> impl Future<Output = Result<LaunchOutcome, LaunchError>>;
}

// ---------------------------------------------------------------------------
// CommandLauncher
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

/// Point the worker's stdout and stderr at its log file. Without one, a
/// foreground worker shares our stdio and a detached worker gets null.
fn open_log(spec: &WorkerSpec, mode: LaunchMode, cmd: &mut Command) -> Result<(), LaunchError> {
    let Some(path) = &spec.log else {
        if mode == LaunchMode::Detached {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
        return Ok(());
    };
    let log_err = |source| LaunchError::Log {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(log_err)?;
    }
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(log_err)?;
    let stderr = stdout.try_clone().map_err(log_err)?;
    cmd.stdout(stdout);
    cmd.stderr(stderr);
    Ok(())
}

impl Launcher for CommandLauncher {
    async fn launch(
        &self,
        spec: &WorkerSpec,
        mode: LaunchMode,
    ) -> Result<LaunchOutcome, LaunchError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&spec.env);
        cmd.stdin(Stdio::null());
        open_log(spec, mode, &mut cmd)?;

        if mode == LaunchMode::Detached {
            sys::configure_worker_cmd(&mut cmd);
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        tracing::info!("launched '{}' as pid {pid}", spec.command);

        match mode {
            LaunchMode::Foreground => {
                let status = child.wait().await.map_err(LaunchError::Wait)?;
                tracing::info!("worker pid {pid} exited ({status})");
                Ok(LaunchOutcome::Exited {
                    pid,
                    code: status.code(),
                })
            }
            LaunchMode::Detached => {
                match tokio::time::timeout(spec.startup_check, child.wait()).await {
                    Ok(Ok(status)) => Err(LaunchError::ExitedEarly {
                        status: status.to_string(),
                    }),
                    Ok(Err(e)) => Err(LaunchError::Wait(e)),
                    Err(_) => Ok(LaunchOutcome::Running { pid }),
                }
            }
        }
    }
}
