//! Anonymous-pipe fallback backend.
//!
//! Used when no native pseudo-terminal can be opened. The process sees plain
//! pipes, so there is no line discipline, no window size and no job control.

use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{PtyError, normalize_io};
use crate::guarded::GuardedHandle;
use crate::pty::{PseudoTerminal, TerminalConfig, lock, validate_size, wait_for_exit};

/// A process driven through stdin/stdout/stderr pipes.
pub struct PipeProcess {
    stdin: GuardedHandle<Mutex<ChildStdin>>,
    stdout: GuardedHandle<Mutex<ChildStdout>>,
    stderr: GuardedHandle<Mutex<ChildStderr>>,
    child: Mutex<Option<Child>>,
    pid: u32,
    close_grace: Duration,
    close_confirm: Duration,
    closed: OnceLock<Result<(), PtyError>>,
}

impl PipeProcess {
    pub fn spawn(config: &TerminalConfig) -> Result<Self, PtyError> {
        validate_size(config.cols, config.rows)?;

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        if !config.inherit_env {
            cmd.env_clear();
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning piped command: {} with args: {:?}",
            config.command, config.args
        );
        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::Spawn(e.to_string())
        })?;

        let missing = |name: &str| PtyError::Spawn(format!("child {name} pipe was not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let pid = child.id();
        info!("Piped process started with PID: {}", pid);

        Ok(Self {
            stdin: GuardedHandle::new(Arc::new(Mutex::new(stdin))),
            stdout: GuardedHandle::new(Arc::new(Mutex::new(stdout))),
            stderr: GuardedHandle::new(Arc::new(Mutex::new(stderr))),
            child: Mutex::new(Some(child)),
            pid,
            close_grace: config.close_grace,
            close_confirm: config.close_confirm,
            closed: OnceLock::new(),
        })
    }

    /// Read from the process's stderr pipe.
    pub fn read_stderr(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        let stderr = self.stderr.snapshot()?;
        let mut stderr = lock(&stderr);
        read_pipe(&mut *stderr, buf)
    }

    fn teardown(&self) -> Result<(), PtyError> {
        debug!(pid = self.pid, "closing piped process");

        // Closing stdin is the pipe backend's "detach": well-behaved shells exit on EOF.
        drop(self.stdin.invalidate());

        let mut child_slot = lock(&self.child);
        let mut result = Ok(());
        if let Some(mut child) = child_slot.take() {
            let exited = wait_for_exit(self.close_grace, || {
                child.try_wait().map(|status| status.is_some())
            });
            if !exited {
                warn!(pid = self.pid, "piped process still running after grace period, killing");
                if let Err(e) = child.kill() {
                    let err = normalize_io(e);
                    if !err.is_closed() && err_kind(&err) != Some(std::io::ErrorKind::InvalidInput) {
                        result = Err(err);
                    }
                }
                if !wait_for_exit(self.close_confirm, || {
                    child.try_wait().map(|status| status.is_some())
                }) {
                    warn!(pid = self.pid, "piped process did not confirm exit after kill");
                }
            }
        }

        drop(self.stdout.invalidate());
        drop(self.stderr.invalidate());
        info!(pid = self.pid, "piped process closed");
        result
    }
}

fn err_kind(err: &PtyError) -> Option<std::io::ErrorKind> {
    match err {
        PtyError::Io { kind, .. } => Some(*kind),
        _ => None,
    }
}

fn read_pipe(pipe: &mut impl Read, buf: &mut [u8]) -> Result<usize, PtyError> {
    match pipe.read(buf) {
        Ok(0) => Err(PtyError::Closed),
        Ok(n) => Ok(n),
        Err(e) => Err(normalize_io(e)),
    }
}

impl PseudoTerminal for PipeProcess {
    /// Reads stdout. Stderr is available through [`PipeProcess::read_stderr`].
    fn read(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        let stdout = self.stdout.snapshot()?;
        let mut stdout = lock(&stdout);
        read_pipe(&mut *stdout, buf)
    }

    fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let stdin = self.stdin.snapshot()?;
        let normalized = normalize_line_endings(data);
        let mut stdin = lock(&stdin);
        stdin.write_all(&normalized).map_err(normalize_io)?;
        stdin.flush().map_err(normalize_io)?;
        // Report the caller's byte count, not the expanded one.
        Ok(data.len())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        validate_size(cols, rows)?;
        if !self.stdin.is_live() {
            return Err(PtyError::Closed);
        }
        debug!(pid = self.pid, cols, rows, "resize ignored by pipe backend");
        Ok(())
    }

    fn close(&self) -> Result<(), PtyError> {
        self.closed.get_or_init(|| self.teardown()).clone()
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

impl Drop for PipeProcess {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Expand every carriage return not already followed by a line feed into CRLF.
///
/// Keyboard input arrives with bare `\r` for Enter; without a line
/// discipline to translate it the child would never see a line end.
pub fn normalize_line_endings(data: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    let lone_cr = data
        .iter()
        .enumerate()
        .any(|(i, &b)| b == b'\r' && data.get(i + 1) != Some(&b'\n'));
    if !lone_cr {
        return std::borrow::Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len() + 8);
    for (i, &b) in data.iter().enumerate() {
        out.push(b);
        if b == b'\r' && data.get(i + 1) != Some(&b'\n') {
            out.push(b'\n');
        }
    }
    std::borrow::Cow::Owned(out)
}
