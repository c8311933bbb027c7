//! Single-threaded readiness loop over peers and listeners.
//!
//! One iteration is one `poll(2)`: read interest for every open peer without
//! a complete buffered packet, write interest only for peers with queued
//! output, read interest for listeners.
//! Writable peers flush, readable peers receive, then each peer's complete
//! packets are handed to the packet handler one at a time. A failing peer is
//! closed and reported as a [`Notice::Closed`]; it never ends the loop.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use procrpc_transport::poll::{self, Interest};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{PeerError, Result};
use crate::listener::PeerListener;
use crate::packet::Packet;
use crate::peer::{Peer, PeerRef};

/// Something the loop owner has to act on after an iteration.
#[derive(Debug)]
pub enum Notice {
    /// The peer failed and has been closed.
    Closed { peer: PeerRef, error: PeerError },
    /// A listener accepted a new peer.
    Accepted { listener: usize, peer: Peer },
}

struct Slot {
    read: Option<usize>,
    write: Option<usize>,
}

fn interest_index(interests: &mut Vec<Interest>, fd: RawFd, read: bool, write: bool) -> usize {
    if let Some(pos) = interests.iter().position(|i| i.fd == fd) {
        interests[pos].read |= read;
        interests[pos].write |= write;
        return pos;
    }
    interests.push(Interest { fd, read, write });
    interests.len() - 1
}

fn fail(peer: &PeerRef, error: PeerError, notices: &mut Vec<Notice>) {
    {
        let mut p = peer.borrow_mut();
        match &error {
            PeerError::Disconnected(_) => info!(peer = %p.id(), "peer disconnected"),
            other => warn!(peer = %p.id(), error = %other, "peer failed"),
        }
        if let Err(e) = p.close() {
            debug!(peer = %p.id(), error = %e, "close after failure failed");
        }
    }
    notices.push(Notice::Closed {
        peer: Rc::clone(peer),
        error,
    });
}

/// Wait once for readiness and perform the resulting I/O, without
/// dispatching any packets.
///
/// Uses a zero timeout if any peer already holds a complete packet. Such a
/// peer is not read from until its packets are drained, so packets put back
/// after a correlation wait never count against the buffer limit together
/// with new input.
pub fn wait_io(
    peers: &[PeerRef],
    listeners: &[PeerListener],
    deadline: Option<Instant>,
) -> Result<Vec<Notice>> {
    let mut interests = Vec::new();
    let mut slots = Vec::with_capacity(peers.len());
    let mut buffered = false;

    for peer in peers {
        let p = peer.borrow();
        let Some(read_fd) = p.read_fd() else {
            slots.push(None);
            continue;
        };
        let read = if p.has_packet() {
            buffered = true;
            None
        } else {
            Some(interest_index(&mut interests, read_fd, true, false))
        };
        let write = match (p.wants_write(), p.write_fd()) {
            (true, Some(write_fd)) => Some(interest_index(&mut interests, write_fd, false, true)),
            _ => None,
        };
        slots.push(Some(Slot { read, write }));
    }

    let listener_base = interests.len();
    for listener in listeners {
        interests.push(Interest::read(listener.fd()));
    }

    let timeout = if buffered {
        Some(Duration::ZERO)
    } else {
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    };

    let ready = poll::wait(&interests, timeout)?;
    let mut notices = Vec::new();

    for (peer, slot) in peers.iter().zip(slots) {
        let Some(slot) = slot else { continue };

        if let Some(write) = slot.write {
            if ready[write].is_ready() {
                let flushed = peer.borrow_mut().flush_nonblocking();
                if let Err(e) = flushed {
                    fail(peer, e, &mut notices);
                    continue;
                }
            }
        }

        if slot.read.is_some_and(|read| ready[read].readable) {
            let received = peer.borrow_mut().receive_nonblocking();
            if let Err(e) = received {
                fail(peer, e, &mut notices);
            }
        }
    }

    for (index, listener) in listeners.iter().enumerate() {
        if !ready[listener_base + index].readable {
            continue;
        }
        loop {
            match listener.accept() {
                Ok(Some(peer)) => notices.push(Notice::Accepted {
                    listener: index,
                    peer,
                }),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    Ok(notices)
}

/// One full loop iteration: [`wait_io`], then hand every complete packet of
/// every open peer to `on_packet`, in peer registration order.
///
/// An error from `on_packet` or an unrecognized packet fails that peer; an
/// undecodable payload only skips the packet.
pub fn poll_once<F>(
    peers: &[PeerRef],
    listeners: &[PeerListener],
    deadline: Option<Instant>,
    mut on_packet: F,
) -> Result<Vec<Notice>>
where
    F: FnMut(&PeerRef, Packet) -> Result<()>,
{
    let mut notices = wait_io(peers, listeners, deadline)?;

    for peer in peers {
        loop {
            let packet = {
                let mut p = peer.borrow_mut();
                if p.is_closed() || !p.has_packet() {
                    break;
                }
                p.take_packet()
            };
            match packet {
                Ok(packet) => {
                    if let Err(e) = on_packet(peer, packet) {
                        if e.is_fatal() {
                            fail(peer, e, &mut notices);
                            break;
                        }
                        warn!(peer = %peer.borrow().id(), error = %e, "packet handling failed");
                    }
                }
                Err(e) if !e.is_fatal() => {
                    warn!(peer = %peer.borrow().id(), error = %e, "skipping undecodable packet");
                }
                Err(e) => {
                    fail(peer, e, &mut notices);
                    break;
                }
            }
        }
    }

    Ok(notices)
}

/// Why a loop returned.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    /// [`Reactor::stop`] was called with this value.
    Stopped(Value),
    /// The deadline passed.
    TimedOut,
}

/// Stop requests for nested loops.
///
/// Cheap to clone; clones share state, so a method or callback can hold one
/// to stop the loop it runs in.
#[derive(Debug, Clone, Default)]
pub struct Reactor {
    frames: Rc<RefCell<Vec<Option<Value>>>>,
}

/// Pops the loop frame it pushed, also when the loop exits with an error.
struct FrameGuard<'a> {
    reactor: &'a Reactor,
    depth: usize,
}

impl FrameGuard<'_> {
    fn take_stop(&self) -> Option<Value> {
        self.reactor
            .frames
            .borrow_mut()
            .get_mut(self.depth - 1)
            .and_then(Option::take)
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.reactor.frames.borrow_mut().truncate(self.depth - 1);
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loops currently running.
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn is_running(&self) -> bool {
        self.depth() > 0
    }

    /// Make the innermost running loop return `Stopped(value)` after its
    /// current iteration. Returns `false` if no loop is running.
    pub fn stop(&self, value: Value) -> bool {
        match self.frames.borrow_mut().last_mut() {
            Some(frame) => {
                *frame = Some(value);
                true
            }
            None => false,
        }
    }

    /// Run `iteration` until stopped or until `deadline` passes.
    ///
    /// `iteration` receives the loop deadline and should perform one wait.
    pub fn run<F>(&self, deadline: Option<Instant>, mut iteration: F) -> Result<LoopExit>
    where
        F: FnMut(Option<Instant>) -> Result<()>,
    {
        let depth = {
            let mut frames = self.frames.borrow_mut();
            frames.push(None);
            frames.len()
        };
        let guard = FrameGuard {
            reactor: self,
            depth,
        };

        loop {
            iteration(deadline)?;
            if let Some(value) = guard.take_stop() {
                return Ok(LoopExit::Stopped(value));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(LoopExit::TimedOut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::connector::pair;
    use crate::listener::PeerListener;

    #[test]
    fn run_times_out_without_stop() {
        let reactor = Reactor::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        let exit = reactor
            .run(Some(deadline), |_| Ok(()))
            .expect("loop should end");
        assert_eq!(exit, LoopExit::TimedOut);
        assert!(!reactor.is_running());
    }

    #[test]
    fn stop_outside_loop_is_rejected() {
        assert!(!Reactor::new().stop(json!(1)));
    }

    #[test]
    fn stop_returns_value_after_iteration() {
        let reactor = Reactor::new();
        let handle = reactor.clone();
        let mut iterations = 0;
        let exit = reactor
            .run(None, |_| {
                iterations += 1;
                if iterations == 3 {
                    assert!(handle.stop(json!("done")));
                }
                Ok(())
            })
            .expect("loop should end");
        assert_eq!(exit, LoopExit::Stopped(json!("done")));
        assert_eq!(iterations, 3);
    }

    #[test]
    fn stop_targets_innermost_loop() {
        let reactor = Reactor::new();
        let handle = reactor.clone();
        let mut inner_exit = None;
        let mut outer_iterations = 0;

        let outer = reactor
            .run(None, |_| {
                outer_iterations += 1;
                if outer_iterations == 1 {
                    let nested = handle.clone();
                    inner_exit = Some(handle.run(None, |_| {
                        assert_eq!(nested.depth(), 2);
                        nested.stop(json!("inner"));
                        Ok(())
                    }));
                    assert_eq!(handle.depth(), 1);
                } else {
                    handle.stop(json!("outer"));
                }
                Ok(())
            })
            .expect("outer loop should end");

        let inner = inner_exit
            .expect("inner loop should have run")
            .expect("inner loop should end");
        assert_eq!(inner, LoopExit::Stopped(json!("inner")));
        assert_eq!(outer, LoopExit::Stopped(json!("outer")));
        assert_eq!(outer_iterations, 2);
    }

    #[test]
    fn failing_iteration_pops_frame() {
        let reactor = Reactor::new();
        let result = reactor.run(None, |_| Err(PeerError::Timeout));
        assert!(result.is_err());
        assert_eq!(reactor.depth(), 0);
    }

    #[test]
    fn poll_once_hands_packets_in_order() {
        let (a, b) = pair().expect("pair should be created");
        let (a, b) = (a.into_ref(), b.into_ref());
        {
            let mut a = a.borrow_mut();
            for n in 0..3 {
                a.send_packet(&Packet::Manifest(crate::packet::Manifest {
                    methods: vec![format!("m{n}")],
                }))
                .expect("send should succeed");
            }
        }

        let peers = [Rc::clone(&b)];
        let deadline = Some(Instant::now() + Duration::from_secs(5));
        let mut seen = Vec::new();
        while seen.len() < 3 {
            poll_once(&peers, &[], deadline, |_, packet| {
                if let Packet::Manifest(m) = packet {
                    seen.extend(m.methods);
                }
                Ok(())
            })
            .expect("poll should succeed");
        }
        assert_eq!(seen, ["m0", "m1", "m2"]);
    }

    #[test]
    fn fatal_handler_error_closes_peer() {
        let (a, b) = pair().expect("pair should be created");
        let (a, b) = (a.into_ref(), b.into_ref());
        a.borrow_mut()
            .announce_methods()
            .expect("announce should succeed");

        let peers = [Rc::clone(&b)];
        let deadline = Some(Instant::now() + Duration::from_secs(5));
        let mut notices = Vec::new();
        while notices.is_empty() {
            notices = poll_once(&peers, &[], deadline, |_, _| {
                Err(PeerError::Protocol("unexpected".into()))
            })
            .expect("poll should succeed");
        }
        assert!(matches!(
            notices.as_slice(),
            [Notice::Closed {
                error: PeerError::Protocol(_),
                ..
            }]
        ));
        assert!(b.borrow().is_closed());
    }

    #[test]
    fn listener_accepts_during_wait() {
        let listener = PeerListener::bind("127.0.0.1:0").expect("listener should bind");
        let _client = crate::connector::connect(&listener.local_addr().to_string())
            .expect("client should connect");

        let deadline = Some(Instant::now() + Duration::from_secs(5));
        let listeners = [listener];
        let mut accepted = Vec::new();
        while accepted.is_empty() {
            accepted = wait_io(&[], &listeners, deadline).expect("wait should succeed");
        }
        assert!(matches!(
            accepted.as_slice(),
            [Notice::Accepted { listener: 0, .. }]
        ));
    }
}
