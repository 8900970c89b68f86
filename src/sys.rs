use std::io;

#[derive(Debug, thiserror::Error)]
#[error("invalid signal: {0}")]
pub struct InvalidSignal(pub String);

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("no such process")]
    NoSuchProcess,
    #[error("permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Other(io::Error),
}

// =========================================================================
// Unix implementation
// =========================================================================

#[cfg(unix)]
mod platform {
    use super::*;

    pub use nix::sys::signal::Signal;

    pub const FORCE_SIGNAL: Signal = Signal::SIGKILL;

    pub fn parse_signal(name: &str) -> Result<Signal, InvalidSignal> {
        use std::str::FromStr;
        let upper = name.trim().to_uppercase();
        let normalized = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        Signal::from_str(&normalized).map_err(|_| InvalidSignal(name.to_string()))
    }

    pub fn send_signal(pid: u32, signal: Signal) -> Result<(), SignalError> {
        // pid 0 and negative values address process groups
        let Ok(raw) = i32::try_from(pid) else {
            return Err(SignalError::NoSuchProcess);
        };
        if raw <= 0 {
            return Err(SignalError::NoSuchProcess);
        }
        match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), signal) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Err(SignalError::NoSuchProcess),
            Err(nix::errno::Errno::EPERM) => Err(SignalError::PermissionDenied),
            Err(e) => Err(SignalError::Other(io::Error::other(e))),
        }
    }

    pub fn configure_worker_cmd(cmd: &mut tokio::process::Command) {
        // Own process group: Ctrl-C in the launching terminal must not reach the worker
        cmd.process_group(0);
    }
}

// =========================================================================
// Windows implementation
// =========================================================================

#[cfg(windows)]
mod platform {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Signal {
        Term,
        Kill,
        Int,
    }

    impl std::fmt::Display for Signal {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Signal::Term => write!(f, "SIGTERM"),
                Signal::Kill => write!(f, "SIGKILL"),
                Signal::Int => write!(f, "SIGINT"),
            }
        }
    }

    pub const FORCE_SIGNAL: Signal = Signal::Kill;

    pub fn parse_signal(name: &str) -> Result<Signal, InvalidSignal> {
        let normalized = name.trim().to_uppercase();
        let normalized = normalized.strip_prefix("SIG").unwrap_or(&normalized);
        match normalized {
            "TERM" => Ok(Signal::Term),
            "KILL" => Ok(Signal::Kill),
            "INT" => Ok(Signal::Int),
            _ => Err(InvalidSignal(name.to_string())),
        }
    }

    /// Windows has no signals; every method ends in `TerminateProcess`.
    pub fn send_signal(pid: u32, _signal: Signal) -> Result<(), SignalError> {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_TERMINATE, TerminateProcess,
        };

        const ERROR_ACCESS_DENIED: i32 = 5;
        const ERROR_INVALID_PARAMETER: i32 = 87;

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                let err = io::Error::last_os_error();
                return Err(match err.raw_os_error() {
                    Some(ERROR_INVALID_PARAMETER) => SignalError::NoSuchProcess,
                    Some(ERROR_ACCESS_DENIED) => SignalError::PermissionDenied,
                    _ => SignalError::Other(err),
                });
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(SignalError::Other(io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    pub fn configure_worker_cmd(cmd: &mut tokio::process::Command) {
        // CREATE_NEW_PROCESS_GROUP = 0x00000200
        cmd.creation_flags(0x00000200);
    }
}

pub use platform::*;
