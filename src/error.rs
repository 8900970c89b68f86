use crate::config::ConfigError;
use crate::launcher::LaunchError;

/// Exit code for `stop --strict` when something survived.
pub const EXIT_RESIDUAL: u8 = 1;
/// Exit code for `status` when nothing is running.
pub const EXIT_NOT_RUNNING: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl SupervisorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorError::Config(_) => 2,
            SupervisorError::Launch(_) => 1,
        }
    }
}
