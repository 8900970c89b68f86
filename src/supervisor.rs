//! Start and stop orchestration.
//!
//! `start` force-kills whatever is left of previous instances (by name and
//! by port) and then launches the worker. `stop` escalates per resource:
//! graceful signal, wait up to the grace window, forceful signal on whatever
//! is still there. Named processes always go before the port, since killing
//! the worker usually frees the port on its own. A final verification pass
//! reports leftovers without failing.

use crate::config::Settings;
use crate::launcher::{CommandLauncher, LaunchError, LaunchMode, LaunchOutcome, Launcher};
use crate::matcher::{ProcessMatcher, PsMatcher};
use crate::model::{Method, PortBinding, ProcessHandle, Residual, TerminationOutcome};
use crate::port::{PortProbe, SystemPortProbe};
use crate::retry::{self, POLL_INTERVAL, SETTLE_WINDOW};
use crate::terminator::{SignalTerminator, Terminator};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartReport {
    pub pre_clean: Vec<TerminationOutcome>,
    pub launch: LaunchOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StopReport {
    pub outcomes: Vec<TerminationOutcome>,
    pub residuals: Vec<Residual>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.residuals.is_empty()
    }

    pub fn forceful_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.method == Method::Forceful)
            .count()
    }

    /// Distinct pids that were signalled at all.
    pub fn signalled_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.outcomes.iter().map(|o| o.target.pid).collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternStatus {
    pub pattern: String,
    pub matches: Vec<ProcessHandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub processes: Vec<PatternStatus>,
    pub port: PortBinding,
}

impl StatusReport {
    pub fn is_running(&self) -> bool {
        self.port.is_bound() || self.processes.iter().any(|p| !p.matches.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Resource<'a> {
    Pattern(&'a str),
    Port(u16),
}

impl fmt::Display for Resource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Pattern(p) => write!(f, "processes matching '{p}'"),
            Resource::Port(port) => write!(f, "listeners on port {port}"),
        }
    }
}

fn pid_list(handles: &[ProcessHandle]) -> String {
    handles
        .iter()
        .map(|h| h.pid.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor<P, M, T, L> {
    settings: Settings,
    ports: P,
    matcher: M,
    terminator: T,
    launcher: L,
}

pub type SystemSupervisor =
    Supervisor<SystemPortProbe, PsMatcher, SignalTerminator, CommandLauncher>;

impl SystemSupervisor {
    pub fn system(settings: Settings) -> Self {
        tracing::debug!("using {}", settings.describe_source());
        let terminator = SignalTerminator::new(settings.stop_signal);
        Supervisor::new(
            settings,
            SystemPortProbe::new(),
            PsMatcher::new(),
            terminator,
            CommandLauncher::new(),
        )
    }
}

impl<P, M, T, L> Supervisor<P, M, T, L>
where
    P: PortProbe,
    M: ProcessMatcher,
    T: Terminator,
    L: Launcher,
{
    pub fn new(settings: Settings, ports: P, matcher: M, terminator: T, launcher: L) -> Self {
        Self {
            settings,
            ports,
            matcher,
            terminator,
            launcher,
        }
    }

    async fn probe(&self, resource: Resource<'_>) -> Vec<ProcessHandle> {
        match resource {
            Resource::Pattern(pattern) => self.matcher.find_by_pattern(pattern).await,
            Resource::Port(port) => self.ports.find_owners(port).await.handles(),
        }
    }

    async fn wait_until_gone(&self, resource: Resource<'_>, window: Duration) -> bool {
        retry::poll_until(window, POLL_INTERVAL, move || async move {
            self.probe(resource).await.is_empty()
        })
        .await
    }

    fn resources(&self) -> Vec<Resource<'_>> {
        self.settings
            .patterns
            .iter()
            .map(|p| Resource::Pattern(p))
            .chain(std::iter::once(Resource::Port(self.settings.port)))
            .collect()
    }

    // -- start --

    pub async fn start(&self, mode: LaunchMode) -> Result<StartReport, LaunchError> {
        let pre_clean = self.pre_clean().await;

        tracing::info!("starting worker: {}", self.settings.worker.command);
        let launch = self.launcher.launch(&self.settings.worker, mode).await?;
        Ok(StartReport { pre_clean, launch })
    }

    async fn pre_clean(&self) -> Vec<TerminationOutcome> {
        let mut outcomes = Vec::new();

        // Port first: whoever holds it must go, worker or not
        let mut order = self.resources();
        order.rotate_right(1);

        for resource in order {
            let found = self.probe(resource).await;
            if found.is_empty() {
                continue;
            }
            tracing::info!(
                "pre-clean: killing stale {resource} (pid {})",
                pid_list(&found)
            );
            outcomes.extend(self.terminator.terminate(&found, Method::Forceful).await);
        }

        if outcomes.is_empty() {
            tracing::debug!("pre-clean: nothing to do");
        } else if !self.wait_until_clear(SETTLE_WINDOW).await {
            tracing::warn!("pre-clean: stale instances are still present, launching anyway");
        }
        outcomes
    }

    // -- stop --

    pub async fn stop(&self) -> StopReport {
        let mut report = StopReport::default();

        for resource in self.resources() {
            self.stop_resource(resource, &mut report).await;
        }

        report.residuals = self.verify().await;
        for residual in &report.residuals {
            tracing::warn!("{residual}");
        }
        report
    }

    async fn stop_resource(&self, resource: Resource<'_>, report: &mut StopReport) {
        let found = self.probe(resource).await;
        if found.is_empty() {
            tracing::info!("no {resource}");
            return;
        }

        tracing::info!("stopping {resource} (pid {})", pid_list(&found));
        report
            .outcomes
            .extend(self.terminator.terminate(&found, Method::Graceful).await);

        if self.wait_until_gone(resource, self.settings.grace).await {
            tracing::info!("{resource} exited");
            return;
        }

        let remaining = self.probe(resource).await;
        if remaining.is_empty() {
            return;
        }
        tracing::warn!(
            "{resource} still running after {:?} (pid {}), killing",
            self.settings.grace,
            pid_list(&remaining)
        );
        report
            .outcomes
            .extend(self.terminator.terminate(&remaining, Method::Forceful).await);
    }

    async fn residuals(&self) -> Vec<Residual> {
        let mut residuals = Vec::new();
        for pattern in &self.settings.patterns {
            let found = self.matcher.find_by_pattern(pattern).await;
            if !found.is_empty() {
                residuals.push(Residual::Process {
                    pattern: pattern.clone(),
                    pids: found.iter().map(|h| h.pid).collect(),
                });
            }
        }
        let binding = self.ports.find_owners(self.settings.port).await;
        if binding.is_bound() {
            residuals.push(Residual::Port {
                port: binding.port,
                pids: binding.owning_pids.into_iter().collect(),
            });
        }
        residuals
    }

    async fn wait_until_clear(&self, window: Duration) -> bool {
        retry::poll_until(window, POLL_INTERVAL, move || async move {
            self.residuals().await.is_empty()
        })
        .await
    }

    async fn verify(&self) -> Vec<Residual> {
        if self.wait_until_clear(SETTLE_WINDOW).await {
            Vec::new()
        } else {
            self.residuals().await
        }
    }

    // -- restart --

    pub async fn restart(
        &self,
        mode: LaunchMode,
    ) -> Result<(StopReport, StartReport), LaunchError> {
        let stopped = self.stop().await;
        let started = self.start(mode).await?;
        Ok((stopped, started))
    }

    // -- status --

    pub async fn status(&self) -> StatusReport {
        let mut processes = Vec::new();
        for pattern in &self.settings.patterns {
            processes.push(PatternStatus {
                pattern: pattern.clone(),
                matches: self.matcher.find_by_pattern(pattern).await,
            });
        }
        let port = self.ports.find_owners(self.settings.port).await;
        StatusReport { processes, port }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, WorkerSpec};
    use crate::env_file::parse_env_contents;
    use crate::matcher::Pattern;
    use crate::model::{Delivery, Origin};
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use tokio::time::Instant;

    // -------------------------------------------------------------------
    // Fake OS
    // -------------------------------------------------------------------

    #[derive(Debug, Clone, Copy)]
    enum Exit {
        /// Exits this long after the graceful signal.
        AfterTerm(Duration),
        /// Ignores the graceful signal.
        OnKill,
        /// Cannot be signalled at all (another user's process).
        Never,
    }

    #[derive(Debug, Clone)]
    struct FakeProc {
        pid: u32,
        command: String,
        port: Option<u16>,
        exit: Exit,
        termed_at: Option<Instant>,
        killed: bool,
    }

    impl FakeProc {
        fn alive(&self, now: Instant) -> bool {
            match (self.exit, self.termed_at) {
                (Exit::Never, _) => true,
                _ if self.killed => false,
                (Exit::AfterTerm(delay), Some(at)) => now < at + delay,
                _ => true,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Signal(u32, Method),
        Launch(String),
    }

    #[derive(Default)]
    struct FakeOs {
        procs: RefCell<Vec<FakeProc>>,
        events: RefCell<Vec<Event>>,
        launch_fails: bool,
        next_pid: RefCell<u32>,
    }

    impl FakeOs {
        fn with(self, pid: u32, command: &str, port: Option<u16>, exit: Exit) -> Self {
            self.procs.borrow_mut().push(FakeProc {
                pid,
                command: command.to_string(),
                port,
                exit,
                termed_at: None,
                killed: false,
            });
            self
        }

        fn alive(&self) -> Vec<FakeProc> {
            let now = Instant::now();
            self.procs
                .borrow()
                .iter()
                .filter(|p| p.alive(now))
                .cloned()
                .collect()
        }

        fn signals(&self) -> Vec<(u32, Method)> {
            self.events
                .borrow()
                .iter()
                .filter_map(|e| match e {
                    Event::Signal(pid, method) => Some((*pid, *method)),
                    Event::Launch(_) => None,
                })
                .collect()
        }

        fn launches(&self) -> usize {
            self.events
                .borrow()
                .iter()
                .filter(|e| matches!(e, Event::Launch(_)))
                .count()
        }
    }

    impl PortProbe for &FakeOs {
        async fn find_owners(&self, port: u16) -> PortBinding {
            let owning_pids: BTreeSet<u32> = self
                .alive()
                .iter()
                .filter(|p| p.port == Some(port))
                .map(|p| p.pid)
                .collect();
            PortBinding { port, owning_pids }
        }
    }

    impl ProcessMatcher for &FakeOs {
        async fn find_by_pattern(&self, pattern: &str) -> Vec<ProcessHandle> {
            let compiled = Pattern::new(pattern);
            self.alive()
                .iter()
                .filter(|p| compiled.is_match(&p.command))
                .map(|p| ProcessHandle::matched(p.pid, pattern, p.command.clone()))
                .collect()
        }
    }

    impl Terminator for &FakeOs {
        async fn terminate(
            &self,
            handles: &[ProcessHandle],
            method: Method,
        ) -> Vec<TerminationOutcome> {
            let now = Instant::now();
            let mut outcomes = Vec::new();
            for handle in handles {
                let mut procs = self.procs.borrow_mut();
                let delivery = match procs.iter_mut().find(|p| p.pid == handle.pid) {
                    Some(p) if !p.alive(now) => Delivery::AlreadyExited,
                    None => Delivery::AlreadyExited,
                    Some(p) if matches!(p.exit, Exit::Never) => {
                        Delivery::Failed("permission denied".to_string())
                    }
                    Some(p) => {
                        match method {
                            Method::Graceful => {
                                p.termed_at.get_or_insert(now);
                            }
                            Method::Forceful => p.killed = true,
                        }
                        self.events
                            .borrow_mut()
                            .push(Event::Signal(handle.pid, method));
                        Delivery::Delivered
                    }
                };
                outcomes.push(TerminationOutcome::new(handle.clone(), method, delivery));
            }
            outcomes
        }
    }

    impl Launcher for &FakeOs {
        async fn launch(
            &self,
            spec: &WorkerSpec,
            _mode: LaunchMode,
        ) -> Result<LaunchOutcome, LaunchError> {
            self.events
                .borrow_mut()
                .push(Event::Launch(spec.command.clone()));
            if self.launch_fails {
                return Err(LaunchError::Spawn {
                    program: spec.program.clone(),
                    source: std::io::ErrorKind::NotFound.into(),
                });
            }
            let pid = {
                let mut next = self.next_pid.borrow_mut();
                *next += 1;
                10_000 + *next
            };
            self.procs.borrow_mut().push(FakeProc {
                pid,
                command: spec.command.clone(),
                port: Some(8000),
                exit: Exit::AfterTerm(Duration::from_millis(100)),
                termed_at: None,
                killed: false,
            });
            Ok(LaunchOutcome::Running { pid })
        }
    }

    fn settings() -> Settings {
        let file = parse_env_contents(
            "PORT=8000\nBOTCTL_PATTERNS=mattermost_bot\nBOTCTL_GRACE_SECS=2\nBOTCTL_COMMAND=python3 -m mattermost_bot",
        );
        config::resolve(&file, None, |_| None).unwrap()
    }

    fn supervisor(os: &FakeOs) -> Supervisor<&FakeOs, &FakeOs, &FakeOs, &FakeOs> {
        Supervisor::new(settings(), os, os, os, os)
    }

    const WORKER: &str = "python3 -m mattermost_bot";

    // -------------------------------------------------------------------
    // stop
    // -------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_clean_system_is_noop() {
        let os = FakeOs::default();
        let report = supervisor(&os).stop().await;
        assert!(report.is_clean());
        assert!(report.outcomes.is_empty());
        assert!(os.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_is_idempotent() {
        let os = FakeOs::default().with(42, WORKER, Some(8000), Exit::OnKill);
        let sup = supervisor(&os);

        let first = sup.stop().await;
        assert!(first.is_clean());
        assert_eq!(first.signalled_pids(), vec![42]);

        let second = sup.stop().await;
        assert!(second.is_clean());
        assert!(second.outcomes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_graceful_within_window_sends_no_kill() {
        let os = FakeOs::default().with(
            42,
            WORKER,
            Some(8000),
            Exit::AfterTerm(Duration::from_millis(500)),
        );
        let start = Instant::now();
        let report = supervisor(&os).stop().await;

        assert!(report.is_clean());
        assert_eq!(report.forceful_count(), 0);
        assert_eq!(os.signals(), vec![(42, Method::Graceful)]);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_after_grace_window() {
        let os = FakeOs::default().with(42, WORKER, None, Exit::OnKill);
        let start = Instant::now();
        let report = supervisor(&os).stop().await;

        assert!(report.is_clean());
        assert_eq!(
            os.signals(),
            vec![(42, Method::Graceful), (42, Method::Forceful)]
        );
        assert_eq!(report.forceful_count(), 1);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_names_before_port() {
        // The worker holds the port; stopping it by name frees the port
        let os = FakeOs::default().with(
            42,
            WORKER,
            Some(8000),
            Exit::AfterTerm(Duration::from_millis(100)),
        );
        let report = supervisor(&os).stop().await;

        assert_eq!(os.signals(), vec![(42, Method::Graceful)]);
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| matches!(o.target.origin, Origin::Pattern(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reclaims_port_from_foreign_process() {
        let os = FakeOs::default().with(77, "node server.js", Some(8000), Exit::OnKill);
        let report = supervisor(&os).stop().await;

        assert!(report.is_clean());
        assert_eq!(
            os.signals(),
            vec![(77, Method::Graceful), (77, Method::Forceful)]
        );
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.target.origin == Origin::Port(8000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reports_residuals_without_failing() {
        let os = FakeOs::default().with(42, WORKER, Some(8000), Exit::Never);
        let report = supervisor(&os).stop().await;

        assert!(!report.is_clean());
        assert_eq!(
            report.residuals,
            vec![
                Residual::Process {
                    pattern: "mattermost_bot".to_string(),
                    pids: vec![42],
                },
                Residual::Port {
                    port: 8000,
                    pids: vec![42],
                },
            ]
        );
        assert!(report.outcomes.iter().all(|o| !o.succeeded));
    }

    // -------------------------------------------------------------------
    // start
    // -------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_start_on_free_system_launches() {
        let os = FakeOs::default();
        let report = supervisor(&os).start(LaunchMode::Detached).await.unwrap();

        assert!(report.pre_clean.is_empty());
        assert!(matches!(report.launch, LaunchOutcome::Running { .. }));
        assert_eq!(*os.events.borrow(), vec![Event::Launch(WORKER.to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reclaims_port_from_foreign_process_first() {
        let os = FakeOs::default().with(77, "nginx: worker", Some(8000), Exit::OnKill);
        let report = supervisor(&os).start(LaunchMode::Detached).await.unwrap();

        assert_eq!(report.pre_clean.len(), 1);
        assert_eq!(report.pre_clean[0].method, Method::Forceful);
        assert_eq!(report.pre_clean[0].target.origin, Origin::Port(8000));
        assert_eq!(
            *os.events.borrow(),
            vec![
                Event::Signal(77, Method::Forceful),
                Event::Launch(WORKER.to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_kills_stale_worker() {
        let os = FakeOs::default().with(42, WORKER, None, Exit::OnKill);
        let report = supervisor(&os).start(LaunchMode::Detached).await.unwrap();

        assert_eq!(os.signals(), vec![(42, Method::Forceful)]);
        assert_eq!(report.pre_clean.len(), 1);
        assert_eq!(os.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_launches_even_if_pre_clean_leaves_residue() {
        let os = FakeOs::default().with(42, WORKER, None, Exit::Never);
        let report = supervisor(&os).start(LaunchMode::Detached).await.unwrap();

        assert!(!report.pre_clean[0].succeeded);
        assert_eq!(os.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_launch_failure_is_reported() {
        let os = FakeOs {
            launch_fails: true,
            ..Default::default()
        };
        let err = supervisor(&os)
            .start(LaunchMode::Detached)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(os.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_stop() {
        let os = FakeOs::default();
        let sup = supervisor(&os);
        let started = sup.start(LaunchMode::Detached).await.unwrap();
        let LaunchOutcome::Running { pid } = started.launch else {
            panic!("expected running worker");
        };

        let report = sup.stop().await;
        assert!(report.is_clean());
        assert_eq!(os.signals(), vec![(pid, Method::Graceful)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_running_worker() {
        let os = FakeOs::default().with(
            42,
            WORKER,
            Some(8000),
            Exit::AfterTerm(Duration::from_millis(300)),
        );
        let (stopped, started) = supervisor(&os).restart(LaunchMode::Detached).await.unwrap();

        assert!(stopped.is_clean());
        assert!(started.pre_clean.is_empty());
        assert_eq!(
            *os.events.borrow(),
            vec![
                Event::Signal(42, Method::Graceful),
                Event::Launch(WORKER.to_string()),
            ]
        );
    }

    // -------------------------------------------------------------------
    // status
    // -------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_matches_and_port() {
        let os = FakeOs::default()
            .with(42, WORKER, None, Exit::OnKill)
            .with(77, "node server.js", Some(8000), Exit::OnKill);
        let status = supervisor(&os).status().await;

        assert!(status.is_running());
        assert_eq!(status.processes.len(), 1);
        assert_eq!(status.processes[0].pattern, "mattermost_bot");
        assert_eq!(status.processes[0].matches[0].pid, 42);
        assert_eq!(status.port.owning_pids, BTreeSet::from([77]));
        assert!(os.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_not_running() {
        let os = FakeOs::default();
        let status = supervisor(&os).status().await;
        assert!(!status.is_running());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["port"]["port"], 8000);
        assert_eq!(json["processes"][0]["matches"].as_array().unwrap().len(), 0);
    }
}
