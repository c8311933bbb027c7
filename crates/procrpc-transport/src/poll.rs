//! Readiness waiting over raw descriptors with `poll(2)`.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// What to wait for on one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn read(fd: RawFd) -> Self {
        Self {
            fd,
            read: true,
            write: false,
        }
    }

    pub fn write(fd: RawFd) -> Self {
        Self {
            fd,
            read: false,
            write: true,
        }
    }

    pub fn read_write(fd: RawFd) -> Self {
        Self {
            fd,
            read: true,
            write: true,
        }
    }
}

/// Readiness reported for one [`Interest`].
///
/// Hang-up and error conditions are reported as readable so the following
/// read observes the end of stream (or the error) directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.readable || self.writable
    }
}

/// Block until at least one interest is ready or `timeout` elapses.
///
/// `None` waits indefinitely. The returned vector is index-aligned with
/// `interests`. A wait interrupted by a signal returns no readiness rather
/// than an error.
pub fn wait(interests: &[Interest], timeout: Option<Duration>) -> Result<Vec<Readiness>> {
    if interests.is_empty() && timeout.is_none() {
        return Err(TransportError::EmptyWaitSet);
    }

    let mut fds: Vec<libc::pollfd> = interests
        .iter()
        .map(|interest| {
            let mut events: libc::c_short = 0;
            if interest.read {
                events |= libc::POLLIN;
            }
            if interest.write {
                events |= libc::POLLOUT;
            }
            libc::pollfd {
                fd: interest.fd,
                events,
                revents: 0,
            }
        })
        .collect();

    // SAFETY: `fds` is a valid, exclusively borrowed array of `fds.len()`
    // pollfd structs for the duration of the call.
    let rc = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            timeout_millis(timeout),
        )
    };

    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(vec![Readiness::default(); interests.len()]);
        }
        return Err(TransportError::Io(err));
    }

    Ok(fds
        .iter()
        .map(|fd| Readiness {
            readable: fd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
            writable: fd.revents & libc::POLLOUT != 0,
        })
        .collect())
}

/// Convert to poll's millisecond timeout, rounding up so a sub-millisecond
/// remainder does not turn into a busy zero-timeout loop.
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut millis = d.as_millis();
            if Duration::from_millis(millis as u64) < d {
                millis += 1;
            }
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(25))), 25);
    }

    #[test]
    fn test_readable_after_write() {
        let (mut a, b) = UnixStream::pair().expect("pair should be created");
        let interests = [Interest::read(b.as_raw_fd())];

        let ready = wait(&interests, Some(Duration::ZERO)).expect("poll should succeed");
        assert!(!ready[0].readable, "nothing written yet");

        a.write_all(b"x").expect("write should succeed");
        let ready = wait(&interests, Some(Duration::from_secs(1))).expect("poll should succeed");
        assert!(ready[0].readable);
    }

    #[test]
    fn test_writable_socket() {
        let (a, _b) = UnixStream::pair().expect("pair should be created");
        let ready = wait(&[Interest::write(a.as_raw_fd())], Some(Duration::ZERO))
            .expect("poll should succeed");
        assert!(ready[0].writable);
        assert!(!ready[0].readable);
    }

    #[test]
    fn test_hangup_reports_readable() {
        let (a, b) = UnixStream::pair().expect("pair should be created");
        drop(a);
        let ready = wait(&[Interest::read(b.as_raw_fd())], Some(Duration::ZERO))
            .expect("poll should succeed");
        assert!(ready[0].readable);
    }

    #[test]
    fn test_empty_wait_without_timeout_is_rejected() {
        assert!(matches!(wait(&[], None), Err(TransportError::EmptyWaitSet)));
        let ready = wait(&[], Some(Duration::ZERO)).expect("empty timed wait should succeed");
        assert!(ready.is_empty());
    }
}
