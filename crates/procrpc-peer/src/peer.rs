use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use procrpc_frame::{FrameConfig, FrameError, Framer, DEFAULT_MAX_BUFFER};
use procrpc_transport::poll::{self, Interest};
use procrpc_transport::Connection;
use tracing::{debug, trace, warn};

use crate::error::{PeerError, Result};
use crate::job::{Job, JobHandle};
use crate::packet::{Manifest, Packet};
use crate::proxy::{self, Offer, ProxyState};
use crate::reactor;
use crate::registry::{Method, MethodRegistry, MethodSource};

/// Default read size for one non-blocking receive.
pub const DEFAULT_READ_CHUNK: usize = 4096;

/// Shared handle to a peer.
///
/// Peers live on one thread and are shared between the event loop, proxies
/// and callbacks. Borrows are never held across user code, so a method or
/// callback may itself call into any peer.
pub type PeerRef = Rc<RefCell<Peer>>;

/// Runtime behavior for peer buffers.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Maximum size of the incoming and outgoing buffers. Default: 16 KiB.
    pub max_buffer: usize,
    /// Upper bound for one read. Default: 4 KiB.
    pub read_chunk: usize,
    /// Try one non-blocking flush right after every send. Default: on.
    pub autosend: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_buffer: DEFAULT_MAX_BUFFER,
            read_chunk: DEFAULT_READ_CHUNK,
            autosend: true,
        }
    }
}

/// One end of an RPC connection.
///
/// Owns the connection, the packet framer for incoming bytes and the
/// outgoing byte buffer. It also holds the methods offered to the remote
/// side and the names the remote side has announced.
pub struct Peer {
    id: String,
    connection: Connection,
    framer: Framer,
    outgoing: BytesMut,
    config: PeerConfig,
    methods: Rc<MethodRegistry>,
    remote_methods: Vec<String>,
    proxies: Vec<Rc<RefCell<ProxyState>>>,
}

impl Peer {
    pub fn new(connection: Connection) -> Self {
        Self::with_config(connection, PeerConfig::default())
    }

    pub fn with_config(connection: Connection, config: PeerConfig) -> Self {
        let framer = Framer::with_config(FrameConfig {
            max_buffer: config.max_buffer,
        });
        Self {
            id: connection.label().to_string(),
            connection,
            framer,
            outgoing: BytesMut::new(),
            config,
            methods: Rc::new(MethodRegistry::new()),
            remote_methods: Vec::new(),
            proxies: Vec::new(),
        }
    }

    pub fn into_ref(self) -> PeerRef {
        Rc::new(RefCell::new(self))
    }

    /// Peer identifier (connection label unless assigned).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn set_autosend(&mut self, autosend: bool) {
        self.config.autosend = autosend;
    }

    // Outgoing

    /// Encode `value` as a packet and queue it.
    ///
    /// Fails with [`PeerError::BufferOverflow`] if the packet does not fit;
    /// the outgoing buffer is left untouched in that case.
    pub fn send(&mut self, value: &serde_json::Value) -> Result<()> {
        let packet = self.framer.encode(value)?;
        let size = self.outgoing.len() + packet.len();
        if size > self.config.max_buffer {
            warn!(peer = %self.id, size, max = self.config.max_buffer, "outgoing buffer overflow");
            return Err(PeerError::BufferOverflow {
                size,
                max: self.config.max_buffer,
            });
        }
        self.outgoing.extend_from_slice(&packet);
        trace!(peer = %self.id, queued = self.outgoing.len(), "packet queued");

        if self.config.autosend {
            self.flush_nonblocking()?;
        }
        Ok(())
    }

    pub fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let value = packet.to_value()?;
        self.send(&value)
    }

    /// Attempt exactly one write of the queued bytes.
    ///
    /// Returns the number of bytes written; `0` when the transport is not
    /// ready. A write of zero bytes means the remote side is gone.
    pub fn flush_nonblocking(&mut self) -> Result<usize> {
        if self.outgoing.is_empty() {
            return Ok(0);
        }
        match self.connection.write(&self.outgoing) {
            Ok(0) => Err(PeerError::Disconnected(self.id.clone())),
            Ok(n) => {
                self.outgoing.advance(n);
                trace!(peer = %self.id, written = n, remaining = self.outgoing.len(), "flushed");
                Ok(n)
            }
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(self.io_failure(e)),
        }
    }

    /// Whether queued bytes are waiting to be written.
    pub fn wants_write(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Write-only wait until the outgoing buffer is drained.
    ///
    /// Nothing is read meanwhile, so the incoming buffer cannot overflow
    /// while a large backlog is written. `None` waits indefinitely.
    pub fn flush(&mut self, deadline: Option<Instant>) -> Result<()> {
        while self.wants_write() {
            let fd = self
                .write_fd()
                .ok_or_else(|| PeerError::Disconnected(self.id.clone()))?;
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PeerError::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            let ready = poll::wait(&[Interest::write(fd)], timeout)?;
            if ready[0].is_ready() {
                self.flush_nonblocking()?;
            }
        }
        Ok(())
    }

    // Incoming

    /// Attempt exactly one read and feed the bytes to the framer.
    ///
    /// Reads only what the transport reports as available (capped at the
    /// read chunk), or one chunk when availability is unknown. Call this
    /// after a readiness wait: on the stdio transport an unready read blocks.
    pub fn receive_nonblocking(&mut self) -> Result<usize> {
        let len = match self.connection.bytes_available() {
            Some(n) if n > 0 => n.min(self.config.read_chunk),
            _ => self.config.read_chunk,
        };
        let mut buf = vec![0u8; len];
        let n = match self.connection.read(&mut buf) {
            Ok(0) => return Err(PeerError::Disconnected(self.id.clone())),
            Ok(n) => n,
            Err(e) if is_transient(&e) => return Ok(0),
            Err(e) => return Err(self.io_failure(e)),
        };
        trace!(peer = %self.id, read = n, "received");

        match self.framer.feed(&buf[..n]) {
            Ok(()) => Ok(n),
            Err(FrameError::BufferOverflow { size, max }) => {
                warn!(peer = %self.id, size, max, "incoming buffer overflow");
                Err(PeerError::BufferOverflow { size, max })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a complete packet is buffered.
    pub fn has_packet(&self) -> bool {
        self.framer.has_packet()
    }

    /// Take the next buffered packet.
    ///
    /// An undecodable payload fails with [`PeerError::Frame`] and only that
    /// packet is lost; a payload that decodes but is not a packet fails with
    /// [`PeerError::Protocol`].
    pub fn take_packet(&mut self) -> Result<Packet> {
        let value = self.framer.take_packet()?;
        Packet::from_value(value)
    }

    /// Return packets to the front of the incoming stream, keeping order.
    pub fn put_back_all(&mut self, packets: &[Packet]) -> Result<()> {
        let values = packets
            .iter()
            .map(Packet::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.framer.put_back_all(&values)?;
        Ok(())
    }

    // Methods

    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.has(name)
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.names()
    }

    /// Offer a method to the remote side and announce the new manifest.
    pub fn add_method(&mut self, name: impl Into<String>, callable: Method) -> Result<()> {
        Rc::make_mut(&mut self.methods).register(name, callable);
        self.announce_methods()
    }

    /// Offer several methods; announces only if `source` produced any.
    pub fn add_methods(&mut self, source: impl MethodSource) -> Result<()> {
        let added = Rc::make_mut(&mut self.methods).register_all(source);
        if added.is_empty() {
            return Ok(());
        }
        self.announce_methods()
    }

    /// Send the current manifest to the remote side.
    pub fn announce_methods(&mut self) -> Result<()> {
        let manifest = self.methods.manifest();
        debug!(peer = %self.id, methods = ?manifest.methods, "announcing methods");
        self.send_packet(&Packet::Manifest(manifest))
    }

    pub(crate) fn on_manifest(&mut self, manifest: Manifest) {
        debug!(peer = %self.id, methods = ?manifest.methods, "remote methods announced");
        self.remote_methods = manifest.methods;
    }

    pub fn has_remote_method(&self, name: &str) -> bool {
        self.remote_methods.iter().any(|m| m == name)
    }

    pub fn remote_method_names(&self) -> &[String] {
        &self.remote_methods
    }

    // Connection

    pub fn read_fd(&self) -> Option<RawFd> {
        self.connection.read_endpoint()
    }

    pub fn write_fd(&self) -> Option<RawFd> {
        self.connection.write_endpoint()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Close the connection; a child process is killed.
    pub fn close(&mut self) -> Result<()> {
        if !self.connection.is_closed() {
            debug!(peer = %self.id, pending = self.outgoing.len(), "closing peer");
        }
        self.connection.close()?;
        Ok(())
    }

    fn io_failure(&self, err: std::io::Error) -> PeerError {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => PeerError::Disconnected(self.id.clone()),
            _ => PeerError::Io(err),
        }
    }

    // Proxies

    pub(crate) fn register_proxy(&mut self, state: &Rc<RefCell<ProxyState>>) {
        if !self.proxies.iter().any(|p| Rc::ptr_eq(p, state)) {
            self.proxies.push(Rc::clone(state));
        }
    }

    pub(crate) fn prune_proxies(&mut self) {
        self.proxies.retain(|p| p.borrow().expects_responses());
    }

    /// Whether any registered proxy still waits for responses.
    pub fn has_pending_jobs(&self) -> bool {
        self.proxies.iter().any(|p| p.borrow().expects_responses())
    }

    // Dispatch

    /// Handle one incoming packet.
    ///
    /// A manifest updates the remote method names. An unstarted job is
    /// executed with this peer's methods and, unless it ignores its result,
    /// sent back. A finished job is offered to the registered proxies; one
    /// nobody waits for is logged and dropped.
    pub fn dispatch(peer: &PeerRef, packet: Packet) -> Result<()> {
        match packet {
            Packet::Manifest(manifest) => {
                peer.borrow_mut().on_manifest(manifest);
                Ok(())
            }
            Packet::Job(job) if !job.is_started() => Self::execute(peer, job),
            Packet::Job(job) => {
                Self::deliver(peer, job);
                Ok(())
            }
        }
    }

    fn execute(peer: &PeerRef, mut job: Job) -> Result<()> {
        let methods = Rc::clone(&peer.borrow().methods);
        debug!(handle = %job.handle(), method = job.method(), "executing job");
        job.execute(&methods);
        if job.ignores_result() {
            return Ok(());
        }
        peer.borrow_mut().send_packet(&Packet::Job(job))
    }

    fn deliver(peer: &PeerRef, mut job: Job) {
        let proxies = peer.borrow().proxies.clone();
        for state in proxies {
            match proxy::offer(&state, job, peer) {
                Offer::Taken => {
                    peer.borrow_mut().prune_proxies();
                    return;
                }
                Offer::Declined(declined) => job = declined,
            }
        }
        warn!(
            peer = %peer.borrow().id,
            handle = %job.handle(),
            method = job.method(),
            "dropping response nobody is waiting for"
        );
    }

    /// Dispatch every buffered packet.
    pub fn handle_packets(peer: &PeerRef) -> Result<()> {
        loop {
            let packet = {
                let mut p = peer.borrow_mut();
                if !p.has_packet() {
                    return Ok(());
                }
                p.take_packet()
            };
            match packet {
                Ok(packet) => Self::dispatch(peer, packet)?,
                Err(e) if !e.is_fatal() => {
                    warn!(peer = %peer.borrow().id, error = %e, "skipping undecodable packet");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait on this peer alone until the response for `handle` arrives.
    ///
    /// Every other packet received meanwhile is set aside and put back in
    /// arrival order once the wait ends (found or timed out), so normal
    /// dispatch sees it next. Fails with [`PeerError::Timeout`] when
    /// `deadline` passes and with [`PeerError::Disconnected`] once the
    /// connection is closed.
    pub fn wait_job(peer: &PeerRef, handle: JobHandle, deadline: Option<Instant>) -> Result<Job> {
        let mut stash = Vec::new();
        let result = Self::wait_matching(peer, handle, deadline, &mut stash);
        if !stash.is_empty() {
            trace!(count = stash.len(), "putting back packets received while waiting");
            peer.borrow_mut().put_back_all(&stash)?;
        }
        result
    }

    fn wait_matching(
        peer: &PeerRef,
        handle: JobHandle,
        deadline: Option<Instant>,
        stash: &mut Vec<Packet>,
    ) -> Result<Job> {
        let peers = [Rc::clone(peer)];
        loop {
            loop {
                let packet = {
                    let mut p = peer.borrow_mut();
                    if !p.has_packet() {
                        break;
                    }
                    p.take_packet()
                };
                match packet {
                    Ok(Packet::Job(job)) if job.handle() == handle && job.is_started() => {
                        return Ok(job);
                    }
                    Ok(other) => stash.push(other),
                    Err(e) if !e.is_fatal() => {
                        warn!(error = %e, "skipping undecodable packet");
                    }
                    Err(e) => return Err(e),
                }
            }

            if peer.borrow().is_closed() {
                return Err(PeerError::Disconnected(peer.borrow().id.clone()));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(PeerError::Timeout);
            }

            for notice in reactor::wait_io(&peers, &[], deadline)? {
                if let reactor::Notice::Closed { error, .. } = notice {
                    return Err(error);
                }
            }
        }
    }

    /// Serve this peer until it disconnects: execute incoming jobs and
    /// deliver responses. A clean disconnect returns `Ok`.
    pub fn serve(peer: &PeerRef) -> Result<()> {
        let peers = [Rc::clone(peer)];
        loop {
            for notice in reactor::poll_once(&peers, &[], None, Self::dispatch)? {
                if let reactor::Notice::Closed { error, .. } = notice {
                    return match error {
                        PeerError::Disconnected(_) => Ok(()),
                        other => Err(other),
                    };
                }
            }
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .field("outgoing", &self.outgoing.len())
            .field("incoming", &self.framer.buffered_len())
            .field("methods", &self.methods.names())
            .field("remote_methods", &self.remote_methods)
            .finish()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if self.wants_write() && !self.connection.is_closed() {
            if let Err(e) = self.flush_nonblocking() {
                debug!(peer = %self.id, error = %e, "final flush failed");
            }
        }
    }
}
