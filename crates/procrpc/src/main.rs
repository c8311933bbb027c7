mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "procrpc", version, about = "Call methods in worker processes")]
struct Cli {
    /// Output format for results.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "warn",
        env = "PROCRPC_LOG",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Strategy;

    #[test]
    fn parses_call_subcommand() {
        let cli = Cli::try_parse_from([
            "procrpc",
            "call",
            "--spawn",
            "procrpc worker",
            "--strategy",
            "background",
            "double",
            "21",
        ])
        .expect("call args should parse");

        let Command::Call(args) = cli.command else {
            panic!("expected call");
        };
        assert_eq!(args.method, "double");
        assert_eq!(args.args, ["21"]);
        assert_eq!(args.strategy, Strategy::Background);
    }

    #[test]
    fn call_requires_a_target() {
        let err = Cli::try_parse_from(["procrpc", "call", "double"])
            .expect_err("missing target should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn rejects_conflicting_targets() {
        let err = Cli::try_parse_from([
            "procrpc",
            "call",
            "--spawn",
            "worker",
            "--connect",
            "12345",
            "double",
        ])
        .expect_err("conflicting targets should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_worker_listen() {
        let cli = Cli::try_parse_from(["procrpc", "worker", "--listen", "127.0.0.1:0"])
            .expect("worker args should parse");
        let Command::Worker(args) = cli.command else {
            panic!("expected worker");
        };
        assert_eq!(args.listen.as_deref(), Some("127.0.0.1:0"));
    }
}
