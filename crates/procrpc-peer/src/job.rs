use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CallError, PeerError, RemoteError, RemoteErrorKind};
use crate::output;
use crate::registry::MethodRegistry;

/// Random correlation handle identifying one job across both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(u64);

impl JobHandle {
    pub fn random() -> Self {
        Self(rand::rng().random())
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Result of an executed job: a value or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Value(Value),
    Error(RemoteError),
}

/// One remote method invocation.
///
/// A job is created by the caller, sent to the remote side, executed there
/// (which records timestamps, captured output and the outcome) and sent back.
/// Timestamps are microseconds since the UNIX epoch so they stay meaningful
/// after crossing a process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    handle: JobHandle,
    method: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    ignore_result: bool,
    created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ended_at: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outcome: Option<Outcome>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn micros(delta: u64) -> Duration {
    Duration::from_micros(delta)
}

impl Job {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            handle: JobHandle::random(),
            method: method.into(),
            args,
            ignore_result: false,
            created_at: now_micros(),
            started_at: None,
            ended_at: None,
            output: String::new(),
            outcome: None,
        }
    }

    /// A job whose executor sends nothing back.
    pub fn ignoring(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            ignore_result: true,
            ..Self::new(method, args)
        }
    }

    pub fn handle(&self) -> JobHandle {
        self.handle
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn ignores_result(&self) -> bool {
        self.ignore_result
    }

    /// Execution has begun (always true for a job received as a response).
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Output the method wrote while executing.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<u64> {
        self.ended_at
    }

    /// Time spent inside the method.
    pub fn execution_time(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        Some(micros(end.saturating_sub(start)))
    }

    /// Time from creation until the method returned.
    pub fn total_time(&self) -> Option<Duration> {
        Some(micros(self.ended_at?.saturating_sub(self.created_at)))
    }

    /// Time spent outside the method so far: queueing and transfer before
    /// execution plus everything since it ended.
    pub fn overhead(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        let before = start.saturating_sub(self.created_at);
        let after = now_micros().saturating_sub(end);
        Some(micros(before + after))
    }

    /// Run the named method from `registry` and record the outcome.
    ///
    /// Lookup failures, method errors and panics are all captured into the
    /// job as a [`RemoteError`]; nothing is propagated to the caller.
    ///
    /// Only output written through [`output::print`] or [`output::stdout`]
    /// is captured. Writes that go to the process's stdout directly, such as
    /// `println!`, are neither recorded in the job nor re-emitted by
    /// [`resolve`](Self::resolve) on the calling side.
    pub fn execute(&mut self, registry: &MethodRegistry) {
        self.started_at = Some(now_micros());
        let scope = output::capture();

        let result = registry.lookup(&self.method).and_then(|callable| {
            let args = &self.args;
            panic::catch_unwind(AssertUnwindSafe(|| callable(args)))
                .unwrap_or_else(|payload| Err(panicked(payload.as_ref())))
        });

        self.output = scope.finish();
        self.ended_at = Some(now_micros());
        self.outcome = Some(match result {
            Ok(value) => Outcome::Value(value),
            Err(err) => Outcome::Error(err),
        });
    }

    /// Consume the result: re-emit captured output once, then return the
    /// value or the remote error.
    pub fn resolve(self) -> std::result::Result<Value, CallError> {
        let outcome = self
            .outcome
            .ok_or(CallError::Peer(PeerError::JobNotFinished))?;
        if !self.output.is_empty() {
            output::print(&self.output);
        }
        match outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Error(err) => Err(CallError::Remote(err)),
        }
    }
}

fn panicked(payload: &(dyn std::any::Any + Send)) -> RemoteError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "method panicked".to_string()
    };
    RemoteError::new(RemoteErrorKind::Panicked, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::method;
    use serde_json::json;

    fn registry() -> MethodRegistry {
        output::set_passthrough(output::Passthrough::Discard);
        let mut registry = MethodRegistry::new();
        registry.register(
            "double",
            method(|args| Ok(json!(args[0].as_i64().unwrap_or(0) * 2))),
        );
        registry.register(
            "greet",
            method(|args| {
                output::print(&format!("hello {}", args[0].as_str().unwrap_or("?")));
                Ok(Value::Null)
            }),
        );
        registry.register("fail", method(|_| Err(RemoteError::failed("nope"))));
        registry.register("explode", method(|_| panic!("kaboom")));
        registry.register_name("ghost");
        registry
    }

    #[test]
    fn new_job_is_unstarted() {
        let job = Job::new("double", vec![json!(1)]);
        assert!(!job.is_started());
        assert!(!job.is_finished());
        assert!(!job.ignores_result());
        assert!(job.execution_time().is_none());
        assert!(Job::ignoring("double", vec![]).ignores_result());
    }

    #[test]
    fn resolve_before_execution_fails() {
        let job = Job::new("double", vec![json!(1)]);
        assert!(matches!(
            job.resolve(),
            Err(CallError::Peer(PeerError::JobNotFinished))
        ));
    }

    #[test]
    fn execute_records_value_and_timing() {
        let mut job = Job::new("double", vec![json!(21)]);
        job.execute(&registry());
        assert!(job.is_started());
        assert!(job.is_finished());
        assert!(job.output().is_empty());
        assert!(job.execution_time().is_some());
        assert!(job.total_time() >= job.execution_time());
        assert_eq!(job.resolve().unwrap(), json!(42));
    }

    #[test]
    fn execute_captures_output() {
        let mut job = Job::new("greet", vec![json!("world")]);
        job.execute(&registry());
        assert_eq!(job.output(), "hello world");
        assert_eq!(output::depth(), 0);
    }

    #[test]
    fn direct_stdout_writes_are_not_captured() {
        let mut registry = registry();
        registry.register(
            "shout",
            method(|_| {
                println!("straight to stdout");
                output::print("captured");
                Ok(Value::Null)
            }),
        );
        let mut job = Job::new("shout", vec![]);
        job.execute(&registry);
        assert_eq!(job.output(), "captured");
    }

    #[test]
    fn execute_captures_failures() {
        let registry = registry();
        for (name, kind) in [
            ("missing", RemoteErrorKind::UnknownMethod),
            ("ghost", RemoteErrorKind::NotCallable),
            ("fail", RemoteErrorKind::Failed),
            ("explode", RemoteErrorKind::Panicked),
        ] {
            let mut job = Job::new(name, vec![]);
            job.execute(&registry);
            let err = job.resolve().expect_err("job should fail");
            assert_eq!(err.remote_kind(), Some(kind), "method {name}");
        }
        assert_eq!(output::depth(), 0);
    }

    #[test]
    fn panic_message_is_kept() {
        let mut job = Job::new("explode", vec![]);
        job.execute(&registry());
        match job.outcome() {
            Some(Outcome::Error(err)) => assert_eq!(err.message, "kaboom"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn executed_job_survives_serialization() {
        let mut job = Job::new("fail", vec![json!({"a": 1})]);
        job.execute(&registry());
        let value = serde_json::to_value(&job).unwrap();
        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
        assert!(back.is_started());
    }

    #[test]
    fn handles_are_random() {
        let a = Job::new("x", vec![]);
        let b = Job::new("x", vec![]);
        assert_ne!(a.handle(), b.handle());
        assert_eq!(a.handle().to_string().len(), 16);
    }
}
