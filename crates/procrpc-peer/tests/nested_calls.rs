//! Calls issued from inside a running method, across two threads.

use std::cell::RefCell;
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use procrpc_peer::reactor::{self, Notice};
use procrpc_peer::{method, Peer, PeerRef, Proxy, RemoteError};
use procrpc_transport::Connection;
use serde_json::{json, Value};

/// Serve a peer offering `relay`, which asks the caller for `base` and
/// doubles it.
fn spawn_relay(stream: UnixStream) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let connection = Connection::from_unix(stream).expect("relay connection");
        let peer = Peer::new(connection).into_ref();
        let this: Rc<RefCell<Weak<RefCell<Peer>>>> = Rc::default();
        *this.borrow_mut() = Rc::downgrade(&peer);

        let handle = Rc::clone(&this);
        peer.borrow_mut()
            .add_method(
                "relay",
                method(move |_| {
                    let peer = handle
                        .borrow()
                        .upgrade()
                        .ok_or_else(|| RemoteError::failed("peer gone"))?;
                    let base = Proxy::blocking_with_timeout(&peer, Duration::from_secs(5))
                        .call("base", vec![])
                        .map_err(|e| RemoteError::failed(e.to_string()))?
                        .into_value()
                        .and_then(|v| v.as_i64())
                        .ok_or_else(|| RemoteError::failed("base returned nothing"))?;
                    Ok(json!(base * 2))
                }),
            )
            .expect("add_method should succeed");
        Peer::serve(&peer).expect("serve should end cleanly");
    })
}

fn client(stream: UnixStream) -> PeerRef {
    let peer = Peer::new(Connection::from_unix(stream).expect("client connection")).into_ref();
    peer.borrow_mut()
        .add_method("base", method(|_| Ok(json!(10))))
        .expect("add_method should succeed");
    peer
}

#[test]
fn remote_method_calls_back_into_caller() {
    let (local, remote) = UnixStream::pair().expect("socket pair should be created");
    let server = spawn_relay(remote);
    let peer = client(local);

    let result: Rc<RefCell<Option<Value>>> = Rc::default();
    let sink = Rc::clone(&result);
    let proxy = Proxy::callback(&peer, move |job, _| {
        *sink.borrow_mut() = Some(job.resolve().expect("relay should succeed"));
    });
    proxy.call("relay", vec![]).expect("relay should be sent");

    // the loop keeps executing incoming requests while the callback is pending
    let peers = [Rc::clone(&peer)];
    let deadline = Instant::now() + Duration::from_secs(10);
    while result.borrow().is_none() {
        assert!(Instant::now() < deadline, "relay result should arrive");
        let notices = reactor::poll_once(&peers, &[], Some(deadline), Peer::dispatch)
            .expect("poll should succeed");
        assert!(
            !notices.iter().any(|n| matches!(n, Notice::Closed { .. })),
            "relay should stay connected"
        );
    }
    assert_eq!(*result.borrow(), Some(json!(20)));

    drop(proxy);
    drop(peers);
    drop(peer);
    server.join().expect("relay thread should finish");
}

#[test]
fn blocking_wait_holds_back_incoming_requests() {
    let (local, remote) = UnixStream::pair().expect("socket pair should be created");
    let server = spawn_relay(remote);
    let peer = client(local);

    // a blocking wait only looks for its own response, so the relay's
    // request for `base` is put back instead of executed
    let err = Proxy::blocking_with_timeout(&peer, Duration::from_millis(300))
        .call("relay", vec![])
        .expect_err("relay cannot finish while the caller blocks");
    assert!(matches!(err, procrpc_peer::CallError::Timeout(_)));

    // the stashed request is served on the next loop iteration, and the
    // late relay response is then dropped as unclaimed
    let peers = [Rc::clone(&peer)];
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut saw_base = false;
    while !saw_base {
        assert!(Instant::now() < deadline, "base request should be pending");
        reactor::poll_once(&peers, &[], Some(deadline), |p, packet| {
            if let procrpc_peer::Packet::Job(job) = &packet {
                saw_base |= job.method() == "base" && !job.is_started();
            }
            Peer::dispatch(p, packet)
        })
        .expect("poll should succeed");
    }

    drop(peers);
    drop(peer);
    server.join().expect("relay thread should finish");
}
