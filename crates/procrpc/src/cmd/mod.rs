use std::time::Duration;

use clap::{ArgGroup, Args, Subcommand, ValueEnum};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod version;
pub mod worker;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the demo methods over stdio or a TCP port.
    Worker(WorkerArgs),
    /// Call one method on a spawned worker or a remote peer.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Worker(args) => worker::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Accept TCP peers on this address instead of serving stdio
    /// (e.g. 12345, localhost, 0.0.0.0:9000).
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,
    /// Maximum incoming and outgoing buffer size per peer, in bytes.
    #[arg(long, default_value_t = procrpc_frame::DEFAULT_MAX_BUFFER)]
    pub max_buffer: usize,
}

/// How `call` waits for the result.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    Blocking,
    Background,
    Callback,
    Ignore,
}

impl Strategy {
    pub fn name(self) -> &'static str {
        match self {
            Strategy::Blocking => "blocking",
            Strategy::Background => "background",
            Strategy::Callback => "callback",
            Strategy::Ignore => "ignore",
        }
    }
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["spawn", "connect"])))]
pub struct CallArgs {
    /// Method name.
    pub method: String,
    /// Positional arguments; each is parsed as JSON, falling back to a string.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
    /// Spawn this command as the worker (split on whitespace).
    #[arg(long, value_name = "COMMAND")]
    pub spawn: Option<String>,
    /// Connect to a listening worker.
    #[arg(long, value_name = "ADDR")]
    pub connect: Option<String>,
    /// Call strategy.
    #[arg(long, value_enum, default_value = "blocking")]
    pub strategy: Strategy,
    /// Maximum time for connecting and for the result (e.g. 5s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }
}
