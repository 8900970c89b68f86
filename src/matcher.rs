//! Finding live processes by their command line.

use crate::model::ProcessHandle;
use crate::probe::{self, ProbeError};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::future::Future;

const PS: &[&str] = &["ps", "/bin/ps", "/usr/bin/ps"];

pub trait ProcessMatcher {
    /// Processes whose command line matches `pattern`, sorted by pid. Never
    /// includes the calling process or its ancestors.
    fn find_by_pattern(&self, pattern: &str) -> impl Future<Output = Vec<ProcessHandle>>;
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// A regex when the text compiles as one, otherwise a plain substring.
#[derive(Debug, Clone)]
pub enum Pattern {
    Regex(Regex),
    Literal(String),
}

impl Pattern {
    pub fn new(raw: &str) -> Self {
        match Regex::new(raw) {
            Ok(re) => Pattern::Regex(re),
            Err(_) => Pattern::Literal(raw.to_string()),
        }
    }

    pub fn is_match(&self, command: &str) -> bool {
        match self {
            Pattern::Regex(re) => re.is_match(command),
            Pattern::Literal(s) => command.contains(s.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// ps output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsRow {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
}

fn split_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((field, rest)) => Some((field, rest)),
        None if !s.is_empty() => Some((s, "")),
        None => None,
    }
}

/// Parse `ps -eo pid=,ppid=,args=` output.
pub fn parse_ps_output(output: &str) -> Vec<PsRow> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, rest) = split_field(line)?;
            let (ppid, command) = split_field(rest)?;
            Some(PsRow {
                pid: pid.parse().ok()?,
                ppid: ppid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

/// `pid` and every ancestor reachable through the ppid chain.
pub fn lineage(rows: &[PsRow], pid: u32) -> HashSet<u32> {
    let parents: HashMap<u32, u32> = rows.iter().map(|r| (r.pid, r.ppid)).collect();
    let mut seen = HashSet::from([pid]);
    let mut current = pid;
    while let Some(&parent) = parents.get(&current) {
        if parent == 0 || !seen.insert(parent) {
            break;
        }
        current = parent;
    }
    seen
}

pub fn select_matches(
    rows: &[PsRow],
    pattern: &str,
    excluded: &HashSet<u32>,
) -> Vec<ProcessHandle> {
    let compiled = Pattern::new(pattern);
    let mut handles: Vec<ProcessHandle> = rows
        .iter()
        .filter(|row| !excluded.contains(&row.pid))
        .filter(|row| !row.command.is_empty() && compiled.is_match(&row.command))
        .map(|row| ProcessHandle::matched(row.pid, pattern, row.command.clone()))
        .collect();
    handles.sort_by_key(|h| h.pid);
    handles.dedup_by_key(|h| h.pid);
    handles
}

// ---------------------------------------------------------------------------
// PsMatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PsMatcher {
    self_pid: u32,
    ps: &'static [&'static str],
}

impl Default for PsMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PsMatcher {
    pub fn new() -> Self {
        Self::with_tools(PS)
    }

    /// Match with explicit candidate paths for `ps`.
    pub fn with_tools(ps: &'static [&'static str]) -> Self {
        Self {
            self_pid: std::process::id(),
            ps,
        }
    }

    async fn snapshot(&self) -> Result<(Vec<PsRow>, HashSet<u32>), ProbeError> {
        let out = probe::run_first(self.ps, &["-eo", "pid=,ppid=,args="]).await?;
        let rows = parse_ps_output(&out.stdout);
        let mut excluded = lineage(&rows, self.self_pid);
        if let Some(pid) = out.pid {
            excluded.insert(pid);
        }
        Ok((rows, excluded))
    }
}

impl ProcessMatcher for PsMatcher {
    async fn find_by_pattern(&self, pattern: &str) -> Vec<ProcessHandle> {
        match self.snapshot().await {
            Ok((rows, excluded)) => {
                let handles = select_matches(&rows, pattern, &excluded);
                tracing::debug!(
                    pattern,
                    pids = ?handles.iter().map(|h| h.pid).collect::<Vec<_>>(),
                    "process match"
                );
                handles
            }
            Err(e) => {
                tracing::warn!("cannot list processes: {e}; assuming none match '{pattern}'");
                Vec::new()
            }
        }
    }
}
