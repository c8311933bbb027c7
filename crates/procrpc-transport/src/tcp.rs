use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{Result, TransportError};

/// Port used when an address names only a host.
pub const DEFAULT_PORT: u16 = 12345;

/// Timeout for outgoing TCP connects.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Normalize an address string to `host:port`.
///
/// Accepts `host:port`, a bare port (`"9000"` → `127.0.0.1:9000`) or a bare
/// host (`"example.org"` → `example.org:12345`).
pub fn normalize_address(address: &str) -> Result<String> {
    let address = address.trim();
    if address.is_empty() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    if let Ok(port) = address.parse::<u16>() {
        return Ok(format!("127.0.0.1:{port}"));
    }
    if address.parse::<SocketAddr>().is_ok() {
        return Ok(address.to_string());
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            port.parse::<u16>()
                .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
            Ok(address.to_string())
        }
        None => Ok(format!("{address}:{DEFAULT_PORT}")),
        _ => Err(TransportError::InvalidAddress(address.to_string())),
    }
}

/// Connect to `address`, trying each resolved socket address in turn.
pub fn connect(address: &str, timeout: Duration) -> Result<Connection> {
    let address = normalize_address(address)?;
    let connect_err = |source| TransportError::Connect {
        address: address.clone(),
        source,
    };

    let candidates: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(connect_err)?
        .collect();

    let mut last_err = std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "address resolved to nothing",
    );
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                debug!(%address, %candidate, "connected over tcp");
                return Connection::from_tcp(stream);
            }
            Err(e) => {
                debug!(%candidate, error = %e, "tcp connect attempt failed");
                last_err = e;
            }
        }
    }
    Err(connect_err(last_err))
}

/// A listening TCP socket whose accepted streams become [`Connection`]s.
///
/// The socket is non-blocking: [`accept`](Self::accept) returns `None` when
/// no connection is pending, so it can sit in the same readiness wait as the
/// peer streams.
pub struct StreamListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl StreamListener {
    pub fn bind(address: &str) -> Result<Self> {
        let address = normalize_address(address)?;
        let bind_err = |source| TransportError::Bind {
            address: address.clone(),
            source,
        };
        let listener = TcpListener::bind(address.as_str()).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(%local_addr, "listening on tcp");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept one pending connection, if any.
    pub fn accept(&self) -> Result<Option<Connection>> {
        match self.listener.accept() {
            Ok((stream, remote)) => {
                debug!(%remote, local = %self.local_addr, "accepted connection");
                Connection::from_tcp(stream).map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Accept(e)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

impl std::fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{self, Interest};
    use std::io::{Read, Write};

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("9000").unwrap(), "127.0.0.1:9000");
        assert_eq!(normalize_address("localhost:80").unwrap(), "localhost:80");
        assert_eq!(normalize_address("example.org").unwrap(), "example.org:12345");
        assert_eq!(normalize_address("[::1]:8080").unwrap(), "[::1]:8080");
        assert!(normalize_address("").is_err());
        assert!(normalize_address("host:notaport").is_err());
    }

    #[test]
    fn test_accept_without_pending_returns_none() {
        let listener = StreamListener::bind("127.0.0.1:0").expect("bind should succeed");
        assert!(listener.accept().expect("accept should not fail").is_none());
    }

    #[test]
    fn test_connect_and_accept() {
        let listener = StreamListener::bind("127.0.0.1:0").expect("bind should succeed");
        let addr = listener.local_addr().to_string();

        let mut client = connect(&addr, Duration::from_secs(5)).expect("connect should succeed");

        let ready = poll::wait(&[Interest::read(listener.fd())], Some(Duration::from_secs(5)))
            .expect("poll should succeed");
        assert!(ready[0].readable, "listener should report a pending connection");

        let mut server = listener
            .accept()
            .expect("accept should succeed")
            .expect("connection should be pending");

        assert_eq!(client.write(b"hi").expect("write should succeed"), 2);
        poll::wait(
            &[Interest::read(server.read_endpoint().expect("server open"))],
            Some(Duration::from_secs(5)),
        )
        .expect("poll should succeed");
        let mut buf = [0u8; 8];
        let n = server.read(&mut buf).expect("read should succeed");
        assert_eq!(&buf[..n], b"hi");
    }

    #[test]
    fn test_connect_refused() {
        let listener = StreamListener::bind("127.0.0.1:0").expect("bind should succeed");
        let addr = listener.local_addr().to_string();
        drop(listener);

        let err = connect(&addr, Duration::from_secs(1)).expect_err("connect should fail");
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
