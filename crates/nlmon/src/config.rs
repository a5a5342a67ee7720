//! Command line and runtime configuration
//!
//! The command line surface is deliberately small: `-h`/`-?` for help and
//! `-v` to restrict output to VETH interfaces. Logging verbosity comes from
//! `RUST_LOG`.

use crate::error::{NlmonError, Result};
use clap::{ArgAction, Parser};
use std::ffi::OsString;
use std::io::Write;

/// Help text printed for `-h`, `-?` and on a bad command line
pub const USAGE: &str = "\
Usage: nlmon [-h?v]

Options:
  -h    This help text
  -v    Show only events on VETH interfaces

";

/// Log filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// nlmon command line
#[derive(Parser, Debug)]
#[command(name = "nlmon", disable_help_flag = true, disable_version_flag = true)]
#[command(about = "Monitor kernel link and default route changes")]
pub struct Cli {
    /// This help text
    #[arg(short = 'h', short_alias = '?', action = ArgAction::SetTrue)]
    pub help: bool,

    /// Show only events on VETH interfaces
    #[arg(short = 'v', action = ArgAction::SetTrue)]
    pub veth_only: bool,
}

/// Settings the monitor runs with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Report only VETH link events and suppress route events
    pub veth_only: bool,
}

impl From<&Cli> for MonitorConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            veth_only: cli.veth_only,
        }
    }
}

/// What the command line asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print usage and exit successfully
    Help,
    /// Start monitoring
    Run(MonitorConfig),
}

/// Parse `args` (including the program name)
///
/// Any unknown option or stray operand is a [`NlmonError::Usage`].
pub fn parse_args<I, T>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::try_parse_from(args).map_err(|e| {
        let rendered = e.to_string();
        let first = rendered
            .lines()
            .next()
            .unwrap_or_default()
            .trim_start_matches("error: ")
            .to_string();
        NlmonError::Usage(first)
    })?;

    if cli.help {
        return Ok(Command::Help);
    }

    Ok(Command::Run(MonitorConfig::from(&cli)))
}

/// Write [`USAGE`] to stdout
pub fn print_usage() {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(USAGE.as_bytes());
    let _ = stdout.flush();
}
