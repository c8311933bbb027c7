use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use procrpc_transport::StreamListener;

use crate::error::Result;
use crate::peer::{Peer, PeerConfig};

/// Listens for TCP connections and turns them into peers.
///
/// Accepting never blocks, so the listener can share the event loop's wait
/// with the peers it produces.
pub struct PeerListener {
    listener: StreamListener,
    peer_config: PeerConfig,
    next_peer_id: AtomicU64,
}

impl PeerListener {
    /// Bind to `address` (`host:port`, or a bare port on localhost).
    pub fn bind(address: &str) -> Result<Self> {
        let listener = StreamListener::bind(address)?;
        Ok(Self {
            listener,
            peer_config: PeerConfig::default(),
            next_peer_id: AtomicU64::new(1),
        })
    }

    /// Override peer behavior config.
    pub fn with_peer_config(mut self, config: PeerConfig) -> Self {
        self.peer_config = config;
        self
    }

    /// Accept one pending connection and assign an auto-generated peer id.
    pub fn accept(&self) -> Result<Option<Peer>> {
        let Some(connection) = self.listener.accept()? else {
            return Ok(None);
        };
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let mut peer = Peer::with_config(connection, self.peer_config.clone());
        peer.set_id(format!("peer-{id}"));
        Ok(Some(peer))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.listener.fd()
    }
}

impl std::fmt::Debug for PeerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerListener")
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use procrpc_transport::poll::{self, Interest};

    use super::*;
    use crate::connector::connect_with_config;

    fn wait_readable(listener: &PeerListener) {
        poll::wait(&[Interest::read(listener.fd())], Some(Duration::from_secs(5)))
            .expect("poll should succeed");
    }

    #[test]
    fn accept_without_pending_connection() {
        let listener = PeerListener::bind("127.0.0.1:0").expect("listener should bind");
        assert!(listener.accept().expect("accept should not fail").is_none());
    }

    #[test]
    fn accepts_multiple_sequential_connections() {
        let listener = PeerListener::bind("127.0.0.1:0").expect("listener should bind");
        let address = listener.local_addr().to_string();
        let timeout = Duration::from_secs(5);

        let _c1 = connect_with_config(&address, timeout, PeerConfig::default())
            .expect("first client should connect");
        wait_readable(&listener);
        let first = listener
            .accept()
            .expect("first accept should succeed")
            .expect("first connection should be pending");

        let _c2 = connect_with_config(&address, timeout, PeerConfig::default())
            .expect("second client should connect");
        wait_readable(&listener);
        let second = listener
            .accept()
            .expect("second accept should succeed")
            .expect("second connection should be pending");

        assert_eq!(first.id(), "peer-1");
        assert_eq!(second.id(), "peer-2");
    }

    #[test]
    fn accepted_peers_use_listener_config() {
        let config = PeerConfig {
            max_buffer: 1024,
            ..PeerConfig::default()
        };
        let listener = PeerListener::bind("127.0.0.1:0")
            .expect("listener should bind")
            .with_peer_config(config);
        let address = listener.local_addr().to_string();

        let _client = connect_with_config(&address, Duration::from_secs(5), PeerConfig::default())
            .expect("client should connect");
        wait_readable(&listener);
        let peer = listener
            .accept()
            .expect("accept should succeed")
            .expect("connection should be pending");
        assert_eq!(peer.config().max_buffer, 1024);
    }
}
