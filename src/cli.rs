use crate::config::DEFAULT_CONFIG_FILE;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "botctl",
    about = "Start and stop the bot worker, cleaning up stale instances and its port",
    version
)]
pub struct Cli {
    /// Dotenv file with the worker settings
    #[arg(long, global = true, env = "BOTCTL_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print reports as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Kill stale instances, then launch the worker
    Start {
        /// Stay attached and exit with the worker's exit code
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the worker and free its port
    Stop {
        /// Exit non-zero if anything is still running afterwards
        #[arg(long)]
        strict: bool,
    },
    /// Stop, then start
    Restart {
        /// Stay attached and exit with the worker's exit code
        #[arg(long)]
        foreground: bool,
    },
    /// Show matching processes and the port owner
    Status,
}

impl Cli {
    /// Default log filter for the requested verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
