use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::JobHandle;

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] procrpc_transport::TransportError),

    /// Frame-level error (encode/decode of a single packet).
    #[error("frame error: {0}")]
    Frame(#[from] procrpc_frame::FrameError),

    /// Peer disconnected (zero-byte read or write).
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// Incoming or outgoing buffer would exceed its maximum.
    #[error("buffer overflow ({size} bytes, max {max})")]
    BufferOverflow { size: usize, max: usize },

    /// A decoded packet has an unrecognized shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded wait passed its deadline.
    #[error("wait timed out")]
    Timeout,

    /// A job result was requested before the job finished executing.
    #[error("job has not finished executing")]
    JobNotFinished,

    /// No connected peer advertises the requested method.
    #[error("no peer offers method `{0}`")]
    NoRemoteMethod(String),

    /// The task is already scheduled.
    #[error("task already scheduled")]
    DuplicateTask,

    /// The task is not scheduled.
    #[error("task not scheduled")]
    UnknownTask,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// Whether this error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PeerError::Frame(procrpc_frame::FrameError::Decode(_))
                | PeerError::Frame(procrpc_frame::FrameError::Incomplete)
                | PeerError::Timeout
                | PeerError::JobNotFinished
                | PeerError::NoRemoteMethod(_)
                | PeerError::DuplicateTask
                | PeerError::UnknownTask
        )
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Kind of failure captured while executing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// No method registered under the requested name.
    UnknownMethod,
    /// The name is registered but has no callable bound to it.
    NotCallable,
    /// The method returned an error.
    Failed,
    /// The method panicked.
    Panicked,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RemoteErrorKind::UnknownMethod => "unknown method",
            RemoteErrorKind::NotCallable => "method not callable",
            RemoteErrorKind::Failed => "method failed",
            RemoteErrorKind::Panicked => "method panicked",
        };
        f.write_str(name)
    }
}

/// A method failure as plain data, safe to send to another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    /// A method-level failure; the usual way for a method to reject a call.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Failed, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Errors returned to the caller of a remote method.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The remote side executed the job and it failed.
    #[error("remote {0}")]
    Remote(RemoteError),

    /// No response arrived in time.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The handle is not pending on this proxy.
    #[error("no pending job with handle {0}")]
    UnknownJob(JobHandle),

    /// The call never completed because of a local or connection failure.
    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl CallError {
    /// The remote failure kind, if the remote side produced one.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            CallError::Remote(err) => Some(err.kind),
            _ => None,
        }
    }
}

impl From<procrpc_transport::TransportError> for CallError {
    fn from(err: procrpc_transport::TransportError) -> Self {
        CallError::Peer(err.into())
    }
}
