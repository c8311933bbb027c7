use serde::{Deserialize, Serialize};
use serde_json::Value;

use procrpc_frame::FrameError;

use crate::error::{PeerError, Result};
use crate::job::Job;

/// Everything that travels between two peers.
///
/// On the wire this is an internally tagged object:
/// `{"type":"job", ...}` or `{"type":"manifest","methods":[...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    Job(Job),
    Manifest(Manifest),
}

/// Names of the methods one side offers to the other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub methods: Vec<String>,
}

impl Packet {
    pub fn to_value(&self) -> std::result::Result<Value, FrameError> {
        serde_json::to_value(self).map_err(|e| FrameError::Encode(e.to_string()))
    }

    /// Interpret a decoded payload. Anything that is not a known packet is a
    /// protocol error.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| PeerError::Protocol(e.to_string()))
    }
}

impl From<Job> for Packet {
    fn from(job: Job) -> Self {
        Packet::Job(job)
    }
}

impl From<Manifest> for Packet {
    fn from(manifest: Manifest) -> Self {
        Packet::Manifest(manifest)
    }
}
