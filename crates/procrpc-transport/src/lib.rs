//! Duplex byte-stream transports for procrpc.
//!
//! Every peer talks over a [`Connection`], which is one of:
//! - a spawned child process (its stdin/stdout pipes)
//! - a TCP stream (outgoing connect or accepted from a [`StreamListener`])
//! - the current process's own stdin/stdout
//! - a local `UnixStream` pair for in-process wiring
//!
//! Connections expose raw read/write descriptors so a single-threaded event
//! loop can wait on many of them with one [`poll::wait`] call.
//!
//! Unix only: readiness is `poll(2)` and availability is `FIONREAD`.

pub mod connection;
pub mod error;
pub mod poll;
pub mod process;
pub mod stdio;
pub mod tcp;

pub use connection::Connection;
pub use error::{Result, TransportError};
pub use poll::{Interest, Readiness};
pub use process::ChildProcess;
pub use tcp::{StreamListener, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT};

use std::os::fd::RawFd;

/// Put a descriptor into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl with F_GETFL/F_SETFL only reads and updates status flags
    // of a descriptor owned by the caller; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: see above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Number of bytes that can be read from `fd` without blocking.
///
/// Returns `None` when the descriptor does not support `FIONREAD`.
pub(crate) fn bytes_available(fd: RawFd) -> Option<usize> {
    let mut available: libc::c_int = 0;
    // SAFETY: `available` is a valid writable c_int, which is what FIONREAD
    // stores into; `fd` is an open descriptor owned by the caller.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available as *mut libc::c_int) };
    if rc < 0 || available < 0 {
        None
    } else {
        Some(available as usize)
    }
}
