//! The current process's own stdin/stdout as a duplex stream.
//!
//! Descriptors 0 and 1 are borrowed, never closed, and left in blocking
//! mode since they may be shared with the parent's terminal. Reads stay
//! non-blocking in practice because callers read at most the number of
//! bytes `FIONREAD` reports after a readiness wait.
//!
//! Writes have no such bound: a write to descriptor 1 blocks until the
//! parent drains the pipe. When the parent stops reading, a non-blocking
//! flush on this transport stalls the whole event loop of the worker
//! until the pipe has room again.

use std::fs::File;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, RawFd};

pub const STDIN_FD: RawFd = libc::STDIN_FILENO;
pub const STDOUT_FD: RawFd = libc::STDOUT_FILENO;

/// Borrowed stdin/stdout descriptors.
///
/// I/O goes straight to the descriptors. `std::io::stdin()` is not used
/// because its internal buffer would hide bytes from readiness polling.
pub struct StdioPair {
    stdin: ManuallyDrop<File>,
    stdout: ManuallyDrop<File>,
}

impl StdioPair {
    pub fn new() -> Self {
        // SAFETY: descriptors 0 and 1 are open for the life of the process;
        // wrapping them in ManuallyDrop means they are never closed here.
        let (stdin, stdout) = unsafe {
            (
                ManuallyDrop::new(File::from_raw_fd(STDIN_FD)),
                ManuallyDrop::new(File::from_raw_fd(STDOUT_FD)),
            )
        };
        Self { stdin, stdout }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (*self.stdin).read(buf)
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (*self.stdout).write(buf)
    }

    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        (*self.stdout).flush()
    }
}

impl Default for StdioPair {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StdioPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioPair")
            .field("read_fd", &STDIN_FD)
            .field("write_fd", &STDOUT_FD)
            .finish()
    }
}
