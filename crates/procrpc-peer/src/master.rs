//! Orchestrator owning many peers, listeners and scheduled tasks.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::seq::IndexedRandom;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connector;
use crate::error::{CallError, PeerError, Result};
use crate::listener::PeerListener;
use crate::peer::{Peer, PeerConfig, PeerRef};
use crate::proxy::{PendingCall, Proxy};
use crate::reactor::{self, LoopExit, Notice, Reactor};
use crate::registry::{Method, MethodRegistry, MethodSource};
use crate::task::{Task, TaskSet};

type PeerCallback = Box<dyn FnMut(&PeerRef)>;

/// Runs the event loop over a set of peers.
///
/// Methods registered on the master are offered to every current and future
/// peer. Calls through the master are routed to a random peer that
/// advertises the method.
pub struct Master {
    peers: Vec<PeerRef>,
    listeners: Vec<PeerListener>,
    tasks: TaskSet,
    methods: MethodRegistry,
    reactor: Reactor,
    peer_config: PeerConfig,
    on_connect: Vec<PeerCallback>,
    on_disconnect: Vec<PeerCallback>,
    next_peer_id: u64,
}

impl Default for Master {
    fn default() -> Self {
        Self::new()
    }
}

impl Master {
    pub fn new() -> Self {
        Self {
            peers: Vec::new(),
            listeners: Vec::new(),
            tasks: TaskSet::new(),
            methods: MethodRegistry::new(),
            reactor: Reactor::new(),
            peer_config: PeerConfig::default(),
            on_connect: Vec::new(),
            on_disconnect: Vec::new(),
            next_peer_id: 1,
        }
    }

    /// Config used for peers the master creates.
    pub fn with_peer_config(mut self, config: PeerConfig) -> Self {
        self.peer_config = config;
        self
    }

    /// A handle for stopping loops run by this master.
    pub fn reactor(&self) -> Reactor {
        self.reactor.clone()
    }

    // Peers

    /// Take ownership of `peer`: assign an id, install the global methods
    /// and fire the connect callbacks.
    pub fn add_peer(&mut self, mut peer: Peer) -> Result<PeerRef> {
        peer.set_id(format!("peer-{}", self.next_peer_id));
        self.next_peer_id += 1;

        let missing: Vec<(String, Method)> = self
            .methods
            .iter()
            .filter(|(name, _)| !peer.has_method(name))
            .map(|(name, callable)| (name.to_string(), Rc::clone(callable)))
            .collect();
        if !missing.is_empty() {
            peer.add_methods(missing)?;
        }

        info!(peer = %peer.id(), transport = peer.connection().transport_name(), "peer connected");
        let peer = peer.into_ref();
        self.peers.push(Rc::clone(&peer));
        for callback in self.on_connect.iter_mut() {
            callback(&peer);
        }
        Ok(peer)
    }

    /// Spawn `command` as a worker process.
    pub fn spawn(&mut self, command: &str) -> Result<PeerRef> {
        let peer = connector::spawn_with_config(command, self.peer_config.clone())?;
        self.add_peer(peer)
    }

    /// Connect to a peer over TCP.
    pub fn connect(&mut self, address: &str) -> Result<PeerRef> {
        let peer = connector::connect_with_config(
            address,
            procrpc_transport::DEFAULT_CONNECT_TIMEOUT,
            self.peer_config.clone(),
        )?;
        self.add_peer(peer)
    }

    /// Accept TCP peers on `address` while the loop runs.
    pub fn listen(&mut self, address: &str) -> Result<SocketAddr> {
        let listener = PeerListener::bind(address)?.with_peer_config(self.peer_config.clone());
        let addr = listener.local_addr();
        self.listeners.push(listener);
        Ok(addr)
    }

    pub fn peers(&self) -> &[PeerRef] {
        &self.peers
    }

    pub fn peer(&self, id: &str) -> Option<PeerRef> {
        self.peers.iter().find(|p| p.borrow().id() == id).cloned()
    }

    /// Close and forget `peer`, firing the disconnect callbacks.
    pub fn remove_peer(&mut self, peer: &PeerRef) -> Option<PeerRef> {
        let pos = self.peers.iter().position(|p| Rc::ptr_eq(p, peer))?;
        let removed = self.peers.remove(pos);
        {
            let mut p = removed.borrow_mut();
            if let Err(e) = p.close() {
                debug!(peer = %p.id(), error = %e, "close failed");
            }
            info!(peer = %p.id(), "peer removed");
        }
        for callback in self.on_disconnect.iter_mut() {
            callback(&removed);
        }
        Some(removed)
    }

    pub fn on_connect<F>(&mut self, callback: F)
    where
        F: FnMut(&PeerRef) + 'static,
    {
        self.on_connect.push(Box::new(callback));
    }

    pub fn on_disconnect<F>(&mut self, callback: F)
    where
        F: FnMut(&PeerRef) + 'static,
    {
        self.on_disconnect.push(Box::new(callback));
    }

    // Global methods

    /// Offer a method on every current and future peer.
    pub fn add_method(&mut self, name: impl Into<String>, callable: Method) -> Result<()> {
        let name = name.into();
        self.methods.register(name.clone(), Rc::clone(&callable));
        for peer in &self.peers {
            let mut p = peer.borrow_mut();
            if !p.has_method(&name) {
                p.add_method(name.clone(), Rc::clone(&callable))?;
            }
        }
        Ok(())
    }

    pub fn add_methods(&mut self, source: impl MethodSource) -> Result<()> {
        let added: Vec<(String, Method)> = source.into_methods();
        if added.is_empty() {
            return Ok(());
        }
        self.methods.register_all(added.clone());
        for peer in &self.peers {
            let mut p = peer.borrow_mut();
            let new: Vec<(String, Method)> = added
                .iter()
                .filter(|(name, _)| !p.has_method(name))
                .cloned()
                .collect();
            if !new.is_empty() {
                p.add_methods(new)?;
            }
        }
        Ok(())
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.names()
    }

    /// Union of the methods advertised by all peers, first seen first.
    pub fn remote_method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for peer in &self.peers {
            for name in peer.borrow().remote_method_names() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    pub fn has_remote_method(&self, name: &str) -> bool {
        self.peers
            .iter()
            .any(|p| p.borrow().has_remote_method(name))
    }

    /// A random peer advertising `name`.
    pub fn peer_for_method(&self, name: &str) -> Option<PeerRef> {
        let candidates: Vec<&PeerRef> = self
            .peers
            .iter()
            .filter(|p| p.borrow().has_remote_method(name))
            .collect();
        candidates.choose(&mut rand::rng()).map(|p| Rc::clone(p))
    }

    fn route(&self, method: &str) -> std::result::Result<PeerRef, CallError> {
        self.peer_for_method(method)
            .ok_or_else(|| CallError::Peer(PeerError::NoRemoteMethod(method.to_string())))
    }

    /// Blocking call routed by method name.
    pub fn call(&mut self, method: &str, args: Vec<Value>) -> std::result::Result<Value, CallError> {
        let peer = self.route(method)?;
        let dispatched = Proxy::blocking(&peer).call(method, args)?;
        Ok(dispatched.into_value().unwrap_or(Value::Null))
    }

    /// Background call routed by method name.
    pub fn call_background(
        &mut self,
        method: &str,
        args: Vec<Value>,
    ) -> std::result::Result<PendingCall, CallError> {
        let peer = self.route(method)?;
        let proxy = Proxy::background(&peer);
        let dispatched = proxy.call(method, args)?;
        match dispatched.handle() {
            Some(handle) => Ok(PendingCall::new(proxy, handle)),
            None => Err(CallError::Peer(PeerError::Protocol(
                "background call produced no handle".to_string(),
            ))),
        }
    }

    // Tasks

    /// Schedule a task; returns the shared handle used for removal.
    pub fn add_task(&mut self, task: impl Into<Rc<Task>>) -> Result<Rc<Task>> {
        self.tasks.add(task.into())
    }

    pub fn remove_task(&mut self, task: &Rc<Task>) -> Result<Rc<Task>> {
        self.tasks.remove(task)
    }

    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    // Loop

    /// One loop iteration, bounded by `timeout` and the next task deadline.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.iterate(deadline)
    }

    /// Run until [`stop`](Self::stop) or [`halt`](Self::halt); returns the
    /// stop value.
    pub fn run(&mut self) -> Result<Value> {
        match self.run_loop(None)? {
            LoopExit::Stopped(value) => Ok(value),
            LoopExit::TimedOut => Ok(Value::Null),
        }
    }

    /// Run until stopped or until `deadline` passes.
    pub fn run_until(&mut self, deadline: Instant) -> Result<LoopExit> {
        self.run_loop(Some(deadline))
    }

    fn run_loop(&mut self, deadline: Option<Instant>) -> Result<LoopExit> {
        let reactor = self.reactor.clone();
        reactor.run(deadline, |deadline| self.iterate(deadline))
    }

    /// Make the innermost running loop return `value`.
    pub fn stop(&self, value: Value) -> bool {
        self.reactor.stop(value)
    }

    pub fn halt(&self) -> bool {
        self.stop(Value::Null)
    }

    fn iterate(&mut self, deadline: Option<Instant>) -> Result<()> {
        let wait = match (deadline, self.tasks.next_deadline(Instant::now())) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let notices = reactor::poll_once(&self.peers, &self.listeners, wait, Peer::dispatch)?;
        for notice in notices {
            match notice {
                Notice::Closed { peer, .. } => {
                    self.remove_peer(&peer);
                }
                Notice::Accepted { peer, .. } => {
                    if let Err(e) = self.add_peer(peer) {
                        warn!(error = %e, "failed to set up accepted peer");
                    }
                }
            }
        }

        let closed: Vec<PeerRef> = self
            .peers
            .iter()
            .filter(|p| p.borrow().is_closed())
            .cloned()
            .collect();
        for peer in closed {
            self.remove_peer(&peer);
        }

        self.tasks.run_due(Instant::now());
        Ok(())
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        for peer in &self.peers {
            let mut p = peer.borrow_mut();
            if p.wants_write() {
                if let Err(e) = p.flush_nonblocking() {
                    debug!(peer = %p.id(), error = %e, "pending output not flushed");
                }
            }
            if let Err(e) = p.close() {
                debug!(peer = %p.id(), error = %e, "close failed");
            }
        }
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("peers", &self.peers.len())
            .field("listeners", &self.listeners)
            .field("tasks", &self.tasks.len())
            .field("methods", &self.methods.names())
            .finish()
    }
}
