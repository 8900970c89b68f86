use botctl::cli::{Cli, Command};
use botctl::config;
use botctl::error::{EXIT_NOT_RUNNING, EXIT_RESIDUAL, SupervisorError};
use botctl::launcher::{LaunchMode, LaunchOutcome};
use botctl::supervisor::{StartReport, StatusReport, StopReport, SystemSupervisor};
use clap::Parser;
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_filter());

    match run(&cli).await {
        Ok(code) => Ok(code),
        Err(report) => match report.downcast_ref::<SupervisorError>() {
            Some(e) => {
                eprintln!("{} {e}", "error:".red().bold());
                Ok(ExitCode::from(e.exit_code()))
            }
            None => Err(report),
        },
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn launch_mode(foreground: bool) -> LaunchMode {
    if foreground {
        LaunchMode::Foreground
    } else {
        LaunchMode::Detached
    }
}

async fn run(cli: &Cli) -> color_eyre::Result<ExitCode> {
    match cli.command {
        Command::Start { foreground } => {
            let settings = config::load_for_start(&cli.config).map_err(SupervisorError::from)?;
            let report = SystemSupervisor::system(settings)
                .start(launch_mode(foreground))
                .await
                .map_err(SupervisorError::from)?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_start(&report);
            }
            Ok(ExitCode::from(start_exit_code(&report)))
        }
        Command::Stop { strict } => {
            let settings = config::load_for_stop(&cli.config).map_err(SupervisorError::from)?;
            let report = SystemSupervisor::system(settings).stop().await;
            if cli.json {
                print_json(&report)?;
            } else {
                print_stop(&report);
            }
            if strict && !report.is_clean() {
                Ok(ExitCode::from(EXIT_RESIDUAL))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Command::Restart { foreground } => {
            let settings = config::load_for_start(&cli.config).map_err(SupervisorError::from)?;
            let (stop, start) = SystemSupervisor::system(settings)
                .restart(launch_mode(foreground))
                .await
                .map_err(SupervisorError::from)?;
            if cli.json {
                print_json(&RestartReport {
                    stop: &stop,
                    start: &start,
                })?;
            } else {
                print_stop(&stop);
                print_start(&start);
            }
            Ok(ExitCode::from(start_exit_code(&start)))
        }
        Command::Status => {
            let settings = config::load_for_stop(&cli.config).map_err(SupervisorError::from)?;
            let report = SystemSupervisor::system(settings).status().await;
            if cli.json {
                print_json(&report)?;
            } else {
                print_status(&report);
            }
            if report.is_running() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_NOT_RUNNING))
            }
        }
    }
}

#[derive(Serialize)]
struct RestartReport<'a> {
    stop: &'a StopReport,
    start: &'a StartReport,
}

fn start_exit_code(report: &StartReport) -> u8 {
    match report.launch {
        LaunchOutcome::Running { .. } => 0,
        LaunchOutcome::Exited { code, .. } => {
            code.and_then(|c| u8::try_from(c).ok()).unwrap_or(1)
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}es")
    }
}

fn start_summary(report: &StartReport) -> String {
    let launched = match report.launch {
        LaunchOutcome::Running { pid } => format!("worker started (pid {pid})"),
        LaunchOutcome::Exited { pid, code: Some(code) } => {
            format!("worker (pid {pid}) exited with code {code}")
        }
        LaunchOutcome::Exited { pid, code: None } => {
            format!("worker (pid {pid}) was terminated by a signal")
        }
    };
    if report.pre_clean.is_empty() {
        launched
    } else {
        let killed = report.pre_clean.iter().filter(|o| o.succeeded).count();
        format!("{launched}; killed {} first", plural(killed, "stale process"))
    }
}

fn stop_summary(report: &StopReport) -> String {
    let pids = report.signalled_pids();
    let head = if pids.is_empty() {
        "nothing was running".to_string()
    } else {
        let forced = report.forceful_count();
        if forced == 0 {
            format!("stopped {}", plural(pids.len(), "process"))
        } else {
            format!(
                "stopped {} ({forced} killed after the grace period)",
                plural(pids.len(), "process")
            )
        }
    };
    if report.is_clean() {
        head
    } else {
        let leftovers: Vec<String> = report.residuals.iter().map(|r| r.to_string()).collect();
        format!("{head}; left behind: {}", leftovers.join("; "))
    }
}

fn print_start(report: &StartReport) {
    let summary = start_summary(report);
    match report.launch {
        LaunchOutcome::Exited { code: Some(0), .. } | LaunchOutcome::Running { .. } => {
            println!("{}", summary.green());
        }
        LaunchOutcome::Exited { .. } => println!("{}", summary.yellow()),
    }
}

fn print_stop(report: &StopReport) {
    let summary = stop_summary(report);
    if report.is_clean() {
        println!("{}", summary.green());
    } else {
        println!("{}", summary.yellow());
    }
}

fn print_status(report: &StatusReport) {
    if !report.is_running() {
        println!("{}", "not running".yellow());
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("found by").add_attribute(Attribute::Bold),
        Cell::new("pid").add_attribute(Attribute::Bold),
        Cell::new("command").add_attribute(Attribute::Bold),
    ]);
    for status in &report.processes {
        for handle in &status.matches {
            table.add_row(vec![
                Cell::new(handle.origin.to_string()).fg(Color::Cyan),
                Cell::new(handle.pid),
                Cell::new(handle.command.as_deref().unwrap_or("-")),
            ]);
        }
    }
    for handle in report.port.handles() {
        table.add_row(vec![
            Cell::new(handle.origin.to_string()).fg(Color::Magenta),
            Cell::new(handle.pid),
            Cell::new("-"),
        ]);
    }
    println!("{table}");
}
