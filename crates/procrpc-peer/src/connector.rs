use std::time::Duration;

use procrpc_transport::{Connection, DEFAULT_CONNECT_TIMEOUT};
use tracing::debug;

use crate::error::Result;
use crate::output::{self, Passthrough};
use crate::peer::{Peer, PeerConfig};

/// Spawn `command` and talk to it over its stdin/stdout.
pub fn spawn(command: &str) -> Result<Peer> {
    spawn_with_config(command, PeerConfig::default())
}

pub fn spawn_with_config(command: &str, config: PeerConfig) -> Result<Peer> {
    let connection = Connection::spawn(command)?;
    Ok(Peer::with_config(connection, config))
}

/// Connect to a listening peer over TCP (30 second timeout).
pub fn connect(address: &str) -> Result<Peer> {
    connect_with_config(address, DEFAULT_CONNECT_TIMEOUT, PeerConfig::default())
}

pub fn connect_with_config(address: &str, timeout: Duration, config: PeerConfig) -> Result<Peer> {
    let connection = Connection::connect_timeout(address, timeout)?;
    Ok(Peer::with_config(connection, config))
}

/// Talk to the parent process over this process's own stdin/stdout.
///
/// Mirrored method output is redirected to stderr from here on, since stdout
/// now carries packets.
pub fn stdio() -> Peer {
    stdio_with_config(PeerConfig::default())
}

pub fn stdio_with_config(config: PeerConfig) -> Peer {
    if output::passthrough() == Passthrough::Stdout {
        debug!("redirecting mirrored output to stderr");
        output::set_passthrough(Passthrough::Stderr);
    }
    Peer::with_config(Connection::stdio(), config)
}

/// Two connected in-process peers.
pub fn pair() -> Result<(Peer, Peer)> {
    pair_with_config(PeerConfig::default())
}

pub fn pair_with_config(config: PeerConfig) -> Result<(Peer, Peer)> {
    let (a, b) = Connection::pair()?;
    Ok((
        Peer::with_config(a, config.clone()),
        Peer::with_config(b, config),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::PeerListener;

    #[test]
    fn connect_convenience() {
        let listener = PeerListener::bind("127.0.0.1:0").expect("listener should bind");
        let peer = connect(&listener.local_addr().to_string()).expect("client should connect");
        assert!(peer.id().starts_with("tcp:"));
        assert!(!peer.is_closed());
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let listener = PeerListener::bind("127.0.0.1:0").expect("listener should bind");
        let address = listener.local_addr().to_string();
        drop(listener);
        let result = connect_with_config(&address, Duration::from_secs(1), PeerConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn spawn_missing_program_fails() {
        assert!(spawn("procrpc-no-such-worker").is_err());
    }

    #[test]
    fn pair_is_connected() {
        let (a, b) = pair().expect("pair should be created");
        assert_eq!(a.connection().transport_name(), "local");
        assert_eq!(b.connection().transport_name(), "local");
    }
}
