//! Command line arguments
//!
//! Global flags cover configuration and logging; each subcommand carries its
//! own arguments. Logging flags given here override the `[logging]` section
//! of the configuration file.

use crate::app::simulate::SimulationPlan;
use crate::core::styles::palette_to_clap;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "brokerqueue")]
#[command(about = "Durable request/response broker queue")]
#[command(version, long_version = crate::core::version::long_version())]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Log level
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error", "off"])]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(short = 'o', long = "log-format", value_name = "FORMAT", value_parser = ["text", "ext", "json"])]
    pub log_format: Option<String>,

    /// Log file path (use 'none' to disable file logging)
    #[arg(short = 'f', long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Force colored output
    #[arg(long = "color", conflicts_with = "no_color")]
    pub color: bool,

    /// Disable colored output
    #[arg(long = "no-color")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run an in-memory session end to end and report per-client results
    Simulate(SimulateArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of client queues in the session
    #[arg(long = "clients", value_name = "COUNT", default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    pub clients: u64,

    /// Requests each client submits
    #[arg(long = "requests", value_name = "COUNT", default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    pub requests: u64,

    /// Worker tasks pulling from the dispatcher
    #[arg(long = "workers", value_name = "COUNT", default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    pub workers: u64,

    /// Hand every Nth request back for redispatch instead of answering it
    #[arg(long = "fail-every", value_name = "N", value_parser = clap::value_parser!(u64).range(2..))]
    pub fail_every: Option<u64>,
}

impl From<&SimulateArgs> for SimulationPlan {
    fn from(args: &SimulateArgs) -> Self {
        Self {
            clients: args.clients as usize,
            requests: args.requests,
            workers: args.workers as usize,
            fail_every: args.fail_every,
        }
    }
}

impl Args {
    /// Parse the process arguments with help styled for the terminal
    pub fn parse_styled() -> Self {
        let styled = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        let matches = Self::command()
            .styles(palette_to_clap(styled))
            .get_matches();
        Self::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }

    /// Explicit flag, then the configured value, then TTY detection
    pub fn use_color(&self, configured: Option<bool>) -> bool {
        if self.color {
            return true;
        }
        if self.no_color {
            return false;
        }
        configured.unwrap_or_else(|| std::io::stdout().is_terminal())
    }
}
