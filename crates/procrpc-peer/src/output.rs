//! Output mirroring for executing jobs.
//!
//! Methods write their console output through [`stdout()`] (or [`print`]).
//! Every write goes straight through to the process's real output and is
//! also recorded into each active [`CaptureScope`]. A job opens a scope
//! around its method call so the output travels back with the result.
//!
//! When the process's own stdout carries the packet stream (a worker talking
//! over stdio), set the passthrough target to [`Passthrough::Stderr`] so
//! method output cannot interleave with packets.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::marker::PhantomData;

use tracing::debug;

/// Where mirrored output is written besides the capture scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Passthrough {
    #[default]
    Stdout,
    Stderr,
    Discard,
}

thread_local! {
    static SCOPES: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
    static PASSTHROUGH: Cell<Passthrough> = const { Cell::new(Passthrough::Stdout) };
}

/// Set the passthrough target for the current thread.
pub fn set_passthrough(target: Passthrough) {
    PASSTHROUGH.with(|p| p.set(target));
}

pub fn passthrough() -> Passthrough {
    PASSTHROUGH.with(Cell::get)
}

/// An active output capture. Released on drop, including during unwinding.
#[must_use = "output is only captured while the scope is alive"]
pub struct CaptureScope {
    depth: usize,
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

/// Start capturing output on the current thread.
pub fn capture() -> CaptureScope {
    let depth = SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        scopes.push(Vec::new());
        scopes.len()
    });
    CaptureScope {
        depth,
        finished: false,
        _not_send: PhantomData,
    }
}

impl CaptureScope {
    /// Stop capturing and return what was written while the scope was open.
    pub fn finish(mut self) -> String {
        self.finished = true;
        let bytes = release(self.depth);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        if !self.finished {
            release(self.depth);
        }
    }
}

/// Pop the scope at `depth` along with any inner scope left open.
fn release(depth: usize) -> Vec<u8> {
    SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        if scopes.len() < depth {
            return Vec::new();
        }
        let mut inner = scopes.split_off(depth - 1);
        if inner.is_empty() {
            Vec::new()
        } else {
            inner.swap_remove(0)
        }
    })
}

fn record(buf: &[u8]) {
    SCOPES.with(|scopes| {
        for scope in scopes.borrow_mut().iter_mut() {
            scope.extend_from_slice(buf);
        }
    });
}

/// Number of open capture scopes on this thread.
pub fn depth() -> usize {
    SCOPES.with(|scopes| scopes.borrow().len())
}

/// Writer that mirrors into the passthrough target and all capture scopes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mirror;

/// The mirrored standard output.
pub fn stdout() -> Mirror {
    Mirror
}

impl Write for Mirror {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match passthrough() {
            Passthrough::Stdout => std::io::stdout().write_all(buf)?,
            Passthrough::Stderr => std::io::stderr().write_all(buf)?,
            Passthrough::Discard => {}
        }
        record(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match passthrough() {
            Passthrough::Stdout => std::io::stdout().flush(),
            Passthrough::Stderr => std::io::stderr().flush(),
            Passthrough::Discard => Ok(()),
        }
    }
}

/// Write `text` to the mirrored output.
pub fn print(text: &str) {
    if let Err(e) = stdout().write_all(text.as_bytes()) {
        debug!(error = %e, "output passthrough failed");
    }
}
