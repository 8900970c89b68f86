use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// How a process was discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Origin {
    /// Command line matched this pattern.
    Pattern(String),
    /// Process listens on this port.
    Port(u16),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Pattern(p) => write!(f, "pattern '{p}'"),
            Origin::Port(port) => write!(f, "port {port}"),
        }
    }
}

/// A live OS process found by a probe. Never created by botctl.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub origin: Origin,
    pub command: Option<String>,
}

impl ProcessHandle {
    pub fn matched(pid: u32, pattern: &str, command: impl Into<String>) -> Self {
        Self {
            pid,
            origin: Origin::Pattern(pattern.to_string()),
            command: Some(command.into()),
        }
    }

    pub fn port_owner(pid: u32, port: u16) -> Self {
        Self {
            pid,
            origin: Origin::Port(port),
            command: None,
        }
    }
}

/// Snapshot of the listeners on a port at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub port: u16,
    pub owning_pids: BTreeSet<u32>,
}

impl PortBinding {
    pub fn free(port: u16) -> Self {
        Self {
            port,
            owning_pids: BTreeSet::new(),
        }
    }

    pub fn is_bound(&self) -> bool {
        !self.owning_pids.is_empty()
    }

    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.owning_pids
            .iter()
            .map(|&pid| ProcessHandle::port_owner(pid, self.port))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Graceful,
    Forceful,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Graceful => write!(f, "graceful"),
            Method::Forceful => write!(f, "forceful"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Delivered,
    /// The pid was gone before the signal arrived.
    AlreadyExited,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationOutcome {
    pub target: ProcessHandle,
    pub method: Method,
    pub succeeded: bool,
    pub delivery: Delivery,
}

impl TerminationOutcome {
    pub fn new(target: ProcessHandle, method: Method, delivery: Delivery) -> Self {
        let succeeded = !matches!(delivery, Delivery::Failed(_));
        Self {
            target,
            method,
            succeeded,
            delivery,
        }
    }
}

/// Something final verification still found after forceful termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Residual {
    Process { pattern: String, pids: Vec<u32> },
    Port { port: u16, pids: Vec<u32> },
}

impl fmt::Display for Residual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |pids: &[u32]| {
            pids.iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Residual::Process { pattern, pids } => {
                write!(f, "processes matching '{pattern}' still running (pids {})", join(pids))
            }
            Residual::Port { port, pids } => {
                write!(f, "port {port} still bound (pids {})", join(pids))
            }
        }
    }
}
