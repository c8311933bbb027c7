use std::io::IsTerminal;
use std::time::Duration;

use clap::ValueEnum;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// Outcome of one `call` invocation.
#[derive(Debug, Serialize)]
pub struct CallReport<'a> {
    pub method: &'a str,
    pub peer: &'a str,
    pub strategy: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub elapsed_ms: u128,
}

impl<'a> CallReport<'a> {
    pub fn new(method: &'a str, peer: &'a str, strategy: &'a str, elapsed: Duration) -> Self {
        Self {
            method,
            peer,
            strategy,
            result: None,
            elapsed_ms: elapsed.as_millis(),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

pub fn print_report(report: &CallReport<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Pretty => match &report.result {
            Some(result) => println!(
                "{} -> {} (peer={} strategy={} {}ms)",
                report.method,
                result,
                report.peer,
                report.strategy,
                report.elapsed_ms
            ),
            None => println!(
                "{} sent (peer={} strategy={})",
                report.method, report.peer, report.strategy
            ),
        },
        OutputFormat::Raw => match &report.result {
            Some(Value::String(text)) => println!("{text}"),
            Some(other) => println!("{other}"),
            None => {}
        },
    }
}
