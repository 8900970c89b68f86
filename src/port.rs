//! Finding the processes that listen on a TCP port.
//!
//! `lsof` is tried first since it exists on both Linux and macOS and prints
//! bare pids with `-t`. When it is missing, the Linux `ss` socket table is
//! parsed instead.

use crate::model::PortBinding;
use crate::probe::{self, ProbeError};
use regex::Regex;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::LazyLock;

const LSOF: &[&str] = &["lsof", "/usr/sbin/lsof", "/usr/bin/lsof"];
const SS: &[&str] = &["ss", "/usr/sbin/ss", "/sbin/ss"];

static SS_PID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pid=(\d+)").expect("static regex is valid"));

pub trait PortProbe {
    /// Owners of listeners on `port`. Empty when the port is free or when
    /// no probe tool is available.
    fn find_owners(&self, port: u16) -> impl Future<Output = PortBinding>;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemPortProbe {
    lsof: &'static [&'static str],
    ss: &'static [&'static str],
}

impl Default for SystemPortProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemPortProbe {
    pub fn new() -> Self {
        Self::with_tools(LSOF, SS)
    }

    /// Probe with explicit candidate paths for `lsof` and `ss`.
    pub fn with_tools(lsof: &'static [&'static str], ss: &'static [&'static str]) -> Self {
        Self { lsof, ss }
    }

    async fn query(&self, port: u16) -> Result<BTreeSet<u32>, ProbeError> {
        let filter = format!("-iTCP:{port}");
        let args = ["-nP", "-t", filter.as_str(), "-sTCP:LISTEN"];
        match probe::run_first(self.lsof, &args).await {
            // lsof exits 1 with no output when nothing matches
            Ok(out) => return Ok(parse_lsof_output(&out.stdout)),
            Err(ProbeError::Unavailable { .. }) => {
                tracing::debug!("lsof not found, falling back to ss");
            }
            Err(e) => return Err(e),
        }

        let out = probe::run_first(self.ss, &["-Htlnp"]).await?;
        let listeners = parse_ss_output(&out.stdout, port);
        if listeners.hidden > 0 && listeners.pids.is_empty() {
            tracing::warn!(
                "port {port} is bound by a process whose owner is not visible to this user"
            );
        }
        Ok(listeners.pids)
    }
}

impl PortProbe for SystemPortProbe {
    async fn find_owners(&self, port: u16) -> PortBinding {
        match self.query(port).await {
            Ok(owning_pids) => {
                tracing::debug!(port, ?owning_pids, "port probe");
                PortBinding { port, owning_pids }
            }
            Err(e @ ProbeError::Unavailable { .. }) => {
                tracing::warn!("cannot inspect port {port}: {e}; assuming it is free");
                PortBinding::free(port)
            }
            Err(e) => {
                tracing::warn!("port probe failed: {e}; assuming port {port} is free");
                PortBinding::free(port)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse_lsof_output(output: &str) -> BTreeSet<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

#[derive(Debug, Default, PartialEq)]
pub struct SsListeners {
    pub pids: BTreeSet<u32>,
    /// Listeners on the port whose process column was not shown.
    pub hidden: usize,
}

fn local_port(address: &str) -> Option<u16> {
    address.rsplit_once(':')?.1.parse().ok()
}

/// Parse `ss -Htlnp` output, keeping listeners on `port`.
///
/// ```text
/// LISTEN 0 4096 0.0.0.0:8000 0.0.0.0:* users:(("python3",pid=4242,fd=5),("python3",pid=4243,fd=5))
/// ```
pub fn parse_ss_output(output: &str, port: u16) -> SsListeners {
    let mut listeners = SsListeners::default();

    for line in output.lines() {
        let components: Vec<&str> = line.split_whitespace().collect();
        if components.len() < 5 {
            continue;
        }
        if local_port(components[3]) != Some(port) {
            continue;
        }

        let process = components[5..].join(" ");
        let before = listeners.pids.len();
        for caps in SS_PID.captures_iter(&process) {
            if let Ok(pid) = caps[1].parse() {
                listeners.pids.insert(pid);
            }
        }
        if process.is_empty() && listeners.pids.len() == before {
            listeners.hidden += 1;
        }
    }

    listeners
}
