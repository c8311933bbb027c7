use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::process::ChildProcess;
use crate::stdio::{StdioPair, STDIN_FD, STDOUT_FD};

/// A duplex byte stream to one remote peer.
///
/// Reads and writes never block on socket and pipe transports (their
/// descriptors are non-blocking); the stdio transport relies on callers
/// reading at most [`bytes_available`](Self::bytes_available). After
/// [`close`](Self::close) every operation fails with `NotConnected`.
pub struct Connection {
    inner: Option<ConnectionInner>,
    label: String,
}

enum ConnectionInner {
    Process(ChildProcess),
    Tcp(TcpStream),
    Stdio(StdioPair),
    Local(UnixStream),
}

impl Connection {
    /// Spawn `command` and talk to it over its stdin/stdout.
    pub fn spawn(command: &str) -> Result<Self> {
        let child = ChildProcess::spawn(command)?;
        Ok(Self::from_process(child))
    }

    pub fn from_process(child: ChildProcess) -> Self {
        let label = format!("process:{}", child.command());
        Self {
            inner: Some(ConnectionInner::Process(child)),
            label,
        }
    }

    /// Connect over TCP with the default 30 second timeout.
    pub fn connect(address: &str) -> Result<Self> {
        crate::tcp::connect(address, crate::tcp::DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn connect_timeout(address: &str, timeout: Duration) -> Result<Self> {
        crate::tcp::connect(address, timeout)
    }

    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        let label = match stream.peer_addr() {
            Ok(addr) => format!("tcp:{addr}"),
            Err(_) => "tcp".to_string(),
        };
        Ok(Self {
            inner: Some(ConnectionInner::Tcp(stream)),
            label,
        })
    }

    /// The current process's stdin/stdout (worker side of a spawned child).
    pub fn stdio() -> Self {
        Self {
            inner: Some(ConnectionInner::Stdio(StdioPair::new())),
            label: "stdio".to_string(),
        }
    }

    pub fn from_unix(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: Some(ConnectionInner::Local(stream)),
            label: "local".to_string(),
        })
    }

    /// Two connected in-process endpoints.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_unix(a)?, Self::from_unix(b)?))
    }

    /// Descriptor to wait on for readability, `None` once closed.
    pub fn read_endpoint(&self) -> Option<RawFd> {
        self.inner.as_ref().map(|inner| match inner {
            ConnectionInner::Process(child) => child.read_fd(),
            ConnectionInner::Tcp(stream) => stream.as_raw_fd(),
            ConnectionInner::Stdio(_) => STDIN_FD,
            ConnectionInner::Local(stream) => stream.as_raw_fd(),
        })
    }

    /// Descriptor to wait on for writability; equal to the read endpoint for
    /// sockets.
    pub fn write_endpoint(&self) -> Option<RawFd> {
        self.inner.as_ref().map(|inner| match inner {
            ConnectionInner::Process(child) => child.write_fd(),
            ConnectionInner::Tcp(stream) => stream.as_raw_fd(),
            ConnectionInner::Stdio(_) => STDOUT_FD,
            ConnectionInner::Local(stream) => stream.as_raw_fd(),
        })
    }

    /// Bytes readable right now, when the transport can tell.
    pub fn bytes_available(&self) -> Option<usize> {
        self.read_endpoint().and_then(crate::bytes_available)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Child process id for process transports.
    pub fn pid(&self) -> Option<u32> {
        match &self.inner {
            Some(ConnectionInner::Process(child)) => Some(child.pid()),
            _ => None,
        }
    }

    /// Short description for logs, e.g. `tcp:127.0.0.1:9000`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            Some(ConnectionInner::Process(_)) => "process",
            Some(ConnectionInner::Tcp(_)) => "tcp",
            Some(ConnectionInner::Stdio(_)) => "stdio",
            Some(ConnectionInner::Local(_)) => "local",
            None => "closed",
        }
    }

    /// Close the stream. A child process is killed and reaped; the process's
    /// own stdio descriptors are left open. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        debug!(connection = %self.label, "closing connection");
        match inner {
            ConnectionInner::Process(child) => child.kill(),
            ConnectionInner::Tcp(stream) => shutdown(stream.shutdown(std::net::Shutdown::Both)),
            ConnectionInner::Stdio(_) => Ok(()),
            ConnectionInner::Local(stream) => shutdown(stream.shutdown(std::net::Shutdown::Both)),
        }
    }

    fn inner_mut(&mut self) -> std::io::Result<&mut ConnectionInner> {
        self.inner
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))
    }
}

/// A peer that already hung up reports `NotConnected` on shutdown.
fn shutdown(result: std::io::Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(TransportError::Io(e)),
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.inner_mut()? {
            ConnectionInner::Process(child) => child.stdout_mut().read(buf),
            ConnectionInner::Tcp(stream) => stream.read(buf),
            ConnectionInner::Stdio(stdio) => stdio.read(buf),
            ConnectionInner::Local(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.inner_mut()? {
            ConnectionInner::Process(child) => child.stdin_mut().write(buf),
            ConnectionInner::Tcp(stream) => stream.write(buf),
            ConnectionInner::Stdio(stdio) => stdio.write(buf),
            ConnectionInner::Local(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.inner_mut()? {
            ConnectionInner::Process(child) => child.stdin_mut().flush(),
            ConnectionInner::Tcp(stream) => stream.flush(),
            ConnectionInner::Stdio(stdio) => stdio.flush(),
            ConnectionInner::Local(stream) => stream.flush(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if matches!(self.inner, Some(ConnectionInner::Process(_))) {
            if let Err(e) = self.close() {
                debug!(connection = %self.label, error = %e, "failed to close child on drop");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("type", &self.transport_name())
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{self, Interest};

    #[test]
    fn test_pair_round_trip() {
        let (mut a, mut b) = Connection::pair().expect("pair should be created");
        assert_eq!(a.read_endpoint(), a.write_endpoint());
        assert_eq!(a.transport_name(), "local");

        a.write_all(b"hello").expect("write should succeed");
        assert_eq!(b.bytes_available(), Some(5));

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).expect("read should succeed");
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(b.bytes_available(), Some(0));
    }

    #[test]
    fn test_read_without_data_would_block() {
        let (_a, mut b) = Connection::pair().expect("pair should be created");
        let mut buf = [0u8; 4];
        let err = b.read(&mut buf).expect_err("read should not block");
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_read_after_remote_close_is_eof() {
        let (mut a, mut b) = Connection::pair().expect("pair should be created");
        a.close().expect("close should succeed");
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).expect("eof read should succeed"), 0);
    }

    #[test]
    fn test_closed_connection_rejects_io() {
        let (mut a, _b) = Connection::pair().expect("pair should be created");
        a.close().expect("close should succeed");
        a.close().expect("second close should be a no-op");

        assert!(a.is_closed());
        assert_eq!(a.read_endpoint(), None);
        assert_eq!(a.transport_name(), "closed");
        let err = a.write(b"x").expect_err("write on closed connection should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_spawned_process_connection() {
        let mut conn = Connection::spawn("cat").expect("cat should spawn");
        assert_ne!(conn.read_endpoint(), conn.write_endpoint());
        assert!(conn.pid().is_some());

        conn.write_all(b"echo").expect("write should succeed");
        let fd = conn.read_endpoint().expect("connection should be open");
        let ready = poll::wait(&[Interest::read(fd)], Some(Duration::from_secs(5)))
            .expect("poll should succeed");
        assert!(ready[0].readable);

        let available = conn.bytes_available().expect("pipes report availability");
        assert!(available > 0);
        let mut buf = vec![0u8; available];
        let n = conn.read(&mut buf).expect("read should succeed");
        assert_eq!(&buf[..n], &b"echo"[..n]);

        conn.close().expect("close should kill the child");
    }
}
