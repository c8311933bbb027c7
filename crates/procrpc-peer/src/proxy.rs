//! Call strategies: blocking, background, callback and fire-and-forget.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CallError, PeerError};
use crate::job::{Job, JobHandle};
use crate::packet::Packet;
use crate::peer::{Peer, PeerRef};

/// Callback fired with a finished job and the peer it came from.
pub type JobCallback = Rc<dyn Fn(Job, &PeerRef)>;

/// How a proxy handles the job after sending it.
#[derive(Clone)]
pub enum ProxyKind {
    /// Wait for the response on this peer and return it.
    Blocking { timeout: Option<Duration> },
    /// Return the handle; collect with [`Proxy::await_job`].
    Background,
    /// Fire the callback when the response is dispatched.
    Callback(JobCallback),
    /// The remote side executes the job and sends nothing back.
    Ignore,
}

impl ProxyKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyKind::Blocking { .. } => "blocking",
            ProxyKind::Background => "background",
            ProxyKind::Callback(_) => "callback",
            ProxyKind::Ignore => "ignore",
        }
    }
}

impl std::fmt::Debug for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyKind::Blocking { timeout } => f
                .debug_struct("Blocking")
                .field("timeout", timeout)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// What a call produced, depending on the proxy kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Blocking: the remote method's return value.
    Returned(Value),
    /// Background or callback: the job is in flight.
    Pending(JobHandle),
    /// Ignore: the job was queued and nothing will come back.
    Sent,
}

impl Dispatched {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Dispatched::Returned(value) => Some(value),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<JobHandle> {
        match self {
            Dispatched::Pending(handle) => Some(*handle),
            _ => None,
        }
    }
}

enum Pending {
    /// Sent; the response has not been seen yet.
    Waiting,
    /// The response came in through normal dispatch before anyone awaited it.
    Arrived(Job),
    /// The callback fires on arrival.
    Callback,
}

/// Pending-job table shared between a proxy and the peer it sends on.
#[derive(Default)]
pub(crate) struct ProxyState {
    callback: Option<JobCallback>,
    pending: HashMap<JobHandle, Pending>,
}

impl ProxyState {
    /// Still waiting for at least one response from the remote side.
    pub(crate) fn expects_responses(&self) -> bool {
        self.pending
            .values()
            .any(|p| matches!(p, Pending::Waiting | Pending::Callback))
    }
}

pub(crate) enum Offer {
    Taken,
    Declined(Job),
}

/// Offer a dispatched response to a proxy's pending table.
///
/// No borrow of the state or the peer is held while the callback runs.
pub(crate) fn offer(state: &Rc<RefCell<ProxyState>>, job: Job, peer: &PeerRef) -> Offer {
    let handle = job.handle();
    let entry = state.borrow_mut().pending.remove(&handle);
    match entry {
        None => Offer::Declined(job),
        Some(Pending::Waiting) => {
            debug!(%handle, "parking background response");
            state
                .borrow_mut()
                .pending
                .insert(handle, Pending::Arrived(job));
            Offer::Taken
        }
        Some(Pending::Arrived(earlier)) => {
            warn!(%handle, "duplicate response for job");
            state
                .borrow_mut()
                .pending
                .insert(handle, Pending::Arrived(earlier));
            Offer::Declined(job)
        }
        Some(Pending::Callback) => {
            let callback = state.borrow().callback.clone();
            if let Some(callback) = callback {
                debug!(%handle, "firing job callback");
                callback(job, peer);
            }
            Offer::Taken
        }
    }
}

/// Turns method calls into jobs on one peer.
///
/// All four strategies share one type; the [`ProxyKind`] decides what
/// happens after the job is sent. Background and callback proxies register
/// their pending table with the peer so responses arriving through normal
/// dispatch reach them.
pub struct Proxy {
    peer: PeerRef,
    kind: ProxyKind,
    state: Rc<RefCell<ProxyState>>,
}

impl Proxy {
    pub fn new(peer: &PeerRef, kind: ProxyKind) -> Self {
        let callback = match &kind {
            ProxyKind::Callback(callback) => Some(Rc::clone(callback)),
            _ => None,
        };
        Self {
            peer: Rc::clone(peer),
            kind,
            state: Rc::new(RefCell::new(ProxyState {
                callback,
                pending: HashMap::new(),
            })),
        }
    }

    /// Blocking proxy without a timeout.
    pub fn blocking(peer: &PeerRef) -> Self {
        Self::new(peer, ProxyKind::Blocking { timeout: None })
    }

    pub fn blocking_with_timeout(peer: &PeerRef, timeout: Duration) -> Self {
        Self::new(
            peer,
            ProxyKind::Blocking {
                timeout: Some(timeout),
            },
        )
    }

    pub fn background(peer: &PeerRef) -> Self {
        Self::new(peer, ProxyKind::Background)
    }

    pub fn callback<F>(peer: &PeerRef, callback: F) -> Self
    where
        F: Fn(Job, &PeerRef) + 'static,
    {
        Self::new(peer, ProxyKind::Callback(Rc::new(callback)))
    }

    pub fn ignore(peer: &PeerRef) -> Self {
        Self::new(peer, ProxyKind::Ignore)
    }

    pub fn kind(&self) -> &ProxyKind {
        &self.kind
    }

    pub fn peer(&self) -> &PeerRef {
        &self.peer
    }

    /// Call `method` on the remote side.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Dispatched, CallError> {
        match &self.kind {
            ProxyKind::Blocking { timeout } => {
                let job = Job::new(method, args);
                let handle = job.handle();
                self.send(job)?;
                let deadline = timeout.map(|t| Instant::now() + t);
                let response =
                    Peer::wait_job(&self.peer, handle, deadline).map_err(|e| match e {
                        PeerError::Timeout => CallError::Timeout(timeout.unwrap_or_default()),
                        other => CallError::Peer(other),
                    })?;
                response.resolve().map(Dispatched::Returned)
            }
            ProxyKind::Background => self.send_tracked(Job::new(method, args), Pending::Waiting),
            ProxyKind::Callback(_) => self.send_tracked(Job::new(method, args), Pending::Callback),
            ProxyKind::Ignore => {
                self.send(Job::ignoring(method, args))?;
                Ok(Dispatched::Sent)
            }
        }
    }

    fn send(&self, job: Job) -> Result<(), CallError> {
        debug!(
            handle = %job.handle(),
            method = job.method(),
            proxy = self.kind.name(),
            "sending job"
        );
        self.peer.borrow_mut().send_packet(&Packet::Job(job))?;
        Ok(())
    }

    fn send_tracked(&self, job: Job, entry: Pending) -> Result<Dispatched, CallError> {
        let handle = job.handle();
        self.state.borrow_mut().pending.insert(handle, entry);
        self.peer.borrow_mut().register_proxy(&self.state);
        if let Err(e) = self.send(job) {
            self.state.borrow_mut().pending.remove(&handle);
            self.peer.borrow_mut().prune_proxies();
            return Err(e);
        }
        Ok(Dispatched::Pending(handle))
    }

    /// Collect the result of a background call.
    ///
    /// Returns immediately if the response was already dispatched, otherwise
    /// waits on the peer. On timeout the job stays pending and may be awaited
    /// again.
    pub fn await_job(&self, handle: JobHandle, timeout: Option<Duration>) -> Result<Value, CallError> {
        let entry = self.state.borrow_mut().pending.remove(&handle);
        match entry {
            Some(Pending::Arrived(job)) => {
                self.peer.borrow_mut().prune_proxies();
                job.resolve()
            }
            Some(Pending::Waiting) => {
                self.state
                    .borrow_mut()
                    .pending
                    .insert(handle, Pending::Waiting);
                let deadline = timeout.map(|t| Instant::now() + t);
                match Peer::wait_job(&self.peer, handle, deadline) {
                    Ok(job) => {
                        self.state.borrow_mut().pending.remove(&handle);
                        self.peer.borrow_mut().prune_proxies();
                        job.resolve()
                    }
                    Err(PeerError::Timeout) => Err(CallError::Timeout(timeout.unwrap_or_default())),
                    Err(other) => Err(CallError::Peer(other)),
                }
            }
            Some(callback @ Pending::Callback) => {
                self.state.borrow_mut().pending.insert(handle, callback);
                Err(CallError::UnknownJob(handle))
            }
            None => Err(CallError::UnknownJob(handle)),
        }
    }

    /// Whether any job sent through this proxy has not been consumed yet.
    pub fn has_pending_jobs(&self) -> bool {
        !self.state.borrow().pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending.len()
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("kind", &self.kind)
            .field("peer", &self.peer.borrow().id())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// A background call started through an orchestrator.
#[derive(Debug)]
pub struct PendingCall {
    proxy: Proxy,
    handle: JobHandle,
}

impl PendingCall {
    pub(crate) fn new(proxy: Proxy, handle: JobHandle) -> Self {
        Self { proxy, handle }
    }

    pub fn handle(&self) -> JobHandle {
        self.handle
    }

    pub fn peer(&self) -> &PeerRef {
        self.proxy.peer()
    }

    /// Wait for the result.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Value, CallError> {
        self.proxy.await_job(self.handle, timeout)
    }
}
