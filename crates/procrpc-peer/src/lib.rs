//! Peers, jobs and the event loop.
//!
//! A [`Peer`] wraps one [`Connection`](procrpc_transport::Connection) and
//! exchanges [`Packet`]s with the remote side: [`Job`]s to execute or
//! results of executed jobs, and [`Manifest`]s announcing method names.
//! [`Proxy`] issues calls with one of four result strategies. [`Master`]
//! runs the loop over many peers, listeners and scheduled [`Task`]s.
//!
//! Everything here is single-threaded; shared handles are `Rc<RefCell<_>>`.

pub mod connector;
pub mod error;
pub mod job;
pub mod listener;
pub mod master;
pub mod output;
pub mod packet;
pub mod peer;
pub mod proxy;
pub mod reactor;
pub mod registry;
pub mod task;

pub use error::{CallError, PeerError, RemoteError, RemoteErrorKind, Result};
pub use job::{Job, JobHandle, Outcome};
pub use listener::PeerListener;
pub use master::Master;
pub use output::Passthrough;
pub use packet::{Manifest, Packet};
pub use peer::{Peer, PeerConfig, PeerRef, DEFAULT_READ_CHUNK};
pub use proxy::{Dispatched, JobCallback, PendingCall, Proxy, ProxyKind};
pub use reactor::{LoopExit, Notice, Reactor};
pub use registry::{method, Method, MethodRegistry, MethodSource};
pub use task::{Task, TaskSet, TaskState};
