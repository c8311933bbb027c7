//! Call methods in worker processes and remote peers.
//!
//! Packets are JSON values framed between STX and ETX bytes and exchanged
//! over child-process pipes, TCP streams or a process's own stdio. Calls are
//! dispatched with one of four strategies on a single-threaded event loop.
//!
//! # Crate Structure
//!
//! - [`transport`]: connections (child process, TCP, stdio, local pair) and readiness polling
//! - [`frame`]: STX/ETX packet framing and the JSON codec
//! - [`peer`]: peers, jobs, proxies, tasks and the [`Master`](peer::Master) loop

/// Re-export transport types.
pub mod transport {
    pub use procrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use procrpc_frame::*;
}

/// Re-export peer types.
pub mod peer {
    pub use procrpc_peer::*;
}

pub use procrpc_peer::{CallError, Master, Peer, PeerError, Proxy};
