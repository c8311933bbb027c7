use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// A spawned child process with piped stdin/stdout.
///
/// The child's stdin is our write end and its stdout our read end; stderr is
/// inherited so diagnostics from the child reach the terminal.
pub struct ChildProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    command: String,
}

impl ChildProcess {
    /// Spawn `command`, split on whitespace into program and arguments.
    pub fn spawn(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| TransportError::Spawn {
            command: command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(parts);
        Self::spawn_command(cmd, command)
    }

    /// Spawn a prepared [`Command`]; stdio is overridden to piped/piped/inherit.
    pub fn spawn_command(mut cmd: Command, label: &str) -> Result<Self> {
        let spawn_err = |source| TransportError::Spawn {
            command: label.to_string(),
            source,
        };

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_err)?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(spawn_err(std::io::Error::other("child pipes unavailable")));
            }
        };

        crate::set_nonblocking(stdin.as_raw_fd())?;
        crate::set_nonblocking(stdout.as_raw_fd())?;

        info!(command = label, pid = child.id(), "spawned child process");

        Ok(Self {
            child,
            stdin,
            stdout,
            command: label.to_string(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.stdin.as_raw_fd()
    }

    pub(crate) fn stdout_mut(&mut self) -> &mut ChildStdout {
        &mut self.stdout
    }

    pub(crate) fn stdin_mut(&mut self) -> &mut ChildStdin {
        &mut self.stdin
    }

    /// Kill the child (if still running) and reap it.
    pub fn kill(mut self) -> Result<()> {
        match self.child.try_wait()? {
            Some(status) => {
                debug!(command = %self.command, %status, "child already exited");
            }
            None => {
                debug!(command = %self.command, pid = self.child.id(), "killing child process");
                match self.child.kill() {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
                    Err(e) => return Err(e.into()),
                }
                self.child.wait()?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("command", &self.command)
            .field("pid", &self.child.id())
            .finish()
    }
}
