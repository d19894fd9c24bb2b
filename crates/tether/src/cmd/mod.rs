use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};

pub mod run;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the device relay worker against a parent supervisor.
    Run(RunArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Parent socket path. Without it, an inherited NODE_CHANNEL_FD descriptor is used.
    #[arg(long, env = "TETHER_SOCKET", value_name = "PATH")]
    pub socket: Option<String>,
    /// Read records from this file instead of the `inputPath` ready option or stdin.
    #[arg(long, value_name = "PATH")]
    pub input: Option<PathBuf>,
    /// How long a device lookup waits for the parent's reply (e.g. 10s, 500ms).
    #[arg(
        long,
        env = "TETHER_REQUEST_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub request_timeout: Duration,
    /// Upper bound on shutdown once it has started (e.g. 2s).
    #[arg(
        long,
        env = "TETHER_FORCED_EXIT_TIMEOUT",
        default_value = "2s",
        value_parser = parse_duration
    )]
    pub forced_exit_timeout: Duration,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
