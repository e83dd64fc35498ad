use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{PtyError, normalize_io};
use crate::guarded::GuardedHandle;

/// Largest accepted terminal dimension (the console-host limit).
pub const MAX_DIMENSION: u16 = 32767;

/// How long `close` waits for a graceful exit before killing the process.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// How long `close` waits after a kill to confirm the process is gone.
pub const DEFAULT_CLOSE_CONFIRM: Duration = Duration::from_millis(200);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Uniform contract over every pseudo-terminal backend.
///
/// All methods take `&self`; implementations are safe to share between a
/// reader thread, a writer, and whoever eventually calls `close`.
pub trait PseudoTerminal: Send + Sync {
    /// Read process output. End of stream is reported as [`PtyError::Closed`],
    /// never as `Ok(0)`.
    fn read(&self, buf: &mut [u8]) -> Result<usize, PtyError>;

    fn write(&self, data: &[u8]) -> Result<usize, PtyError>;

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Tear the process down. Runs once; later calls return the first result.
    fn close(&self) -> Result<(), PtyError>;

    fn pid(&self) -> Option<u32>;
}

/// Which backend to open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendPreference {
    /// Native PTY, falling back to pipes if it cannot be opened.
    #[default]
    Auto,
    Native,
    Pipes,
}

/// The backend a terminal actually runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// ConPTY on Windows, openpty on unix.
    Native,
    /// stdin/stdout/stderr pipes without terminal semantics.
    Pipes,
}

/// Configuration for spawning a terminal process
#[derive(Clone, Debug)]
pub struct TerminalConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Applied on top of the inherited environment (or alone, see `inherit_env`).
    pub env: Vec<(String, String)>,
    pub inherit_env: bool,
    pub cols: u16,
    pub rows: u16,
    pub backend: BackendPreference,
    pub close_grace: Duration,
    pub close_confirm: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            command: default_shell(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            inherit_env: true,
            cols: 80,
            rows: 24,
            backend: BackendPreference::Auto,
            close_grace: DEFAULT_CLOSE_GRACE,
            close_confirm: DEFAULT_CLOSE_CONFIRM,
        }
    }
}

/// The user's shell, or the platform default.
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Reject dimensions outside `1..=MAX_DIMENSION` before any OS call.
pub fn validate_size(cols: u16, rows: u16) -> Result<(), PtyError> {
    let valid = |d: u16| (1..=MAX_DIMENSION).contains(&d);
    if valid(cols) && valid(rows) {
        Ok(())
    } else {
        Err(PtyError::InvalidSize { cols, rows })
    }
}

/// Poll `exited` until it reports true or `timeout` elapses.
pub(crate) fn wait_for_exit(
    timeout: Duration,
    mut exited: impl FnMut() -> std::io::Result<bool>,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match exited() {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                debug!("try_wait failed while closing: {}", e);
                return false;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Reader = Mutex<Box<dyn Read + Send>>;
type Writer = Mutex<Box<dyn Write + Send>>;
type Master = Mutex<Box<dyn MasterPty + Send>>;

/// A process attached to the platform's native pseudo-terminal.
pub struct NativePty {
    master: GuardedHandle<Master>,
    reader: GuardedHandle<Reader>,
    writer: GuardedHandle<Writer>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    pid: Option<u32>,
    close_grace: Duration,
    close_confirm: Duration,
    closed: OnceLock<Result<(), PtyError>>,
}

impl NativePty {
    /// Open a PTY and spawn the configured command on its slave side.
    pub fn spawn(config: &TerminalConfig) -> Result<Self, PtyError> {
        validate_size(config.cols, config.rows)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            info!("Setting working directory: {}", dir.display());
            cmd.cwd(dir);
        }

        if !config.inherit_env {
            cmd.env_clear();
        }

        // Set environment for proper terminal behavior
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?}",
            config.command, config.args
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::Spawn(e.to_string())
        })?;
        // The slave end belongs to the child now.
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        // Take the writer immediately to keep the PTY stdin open
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(format!("failed to take PTY writer: {e}")))?;

        Ok(Self {
            master: GuardedHandle::new(Arc::new(Mutex::new(pair.master))),
            reader: GuardedHandle::new(Arc::new(Mutex::new(reader))),
            writer: GuardedHandle::new(Arc::new(Mutex::new(writer))),
            child: Mutex::new(Some(child)),
            pid,
            close_grace: config.close_grace,
            close_confirm: config.close_confirm,
            closed: OnceLock::new(),
        })
    }

    fn teardown(&self) -> Result<(), PtyError> {
        debug!(pid = ?self.pid, "closing native PTY");

        // Invalidate first so racing calls stop reaching the OS.
        let writer = self.writer.invalidate();
        let reader = self.reader.invalidate();
        let master = self.master.invalidate();
        drop(writer);

        // Detach the console layer before touching the process; killing a
        // process that still owns a live pseudo-console can wedge conhost.
        drop(master);

        let mut child_slot = lock(&self.child);
        let Some(mut child) = child_slot.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        let exited = wait_for_exit(self.close_grace, || {
            child.try_wait().map(|status| status.is_some())
        });
        if !exited {
            warn!(pid = ?self.pid, "PTY process still running after grace period, killing");
            if let Err(e) = child.kill() {
                let err = normalize_io(e);
                // Already-gone processes report as closed; that is success here.
                if !err.is_closed() {
                    result = Err(err);
                }
            }
            if !wait_for_exit(self.close_confirm, || {
                child.try_wait().map(|status| status.is_some())
            }) {
                warn!(pid = ?self.pid, "PTY process did not confirm exit after kill");
            }
        }

        drop(child);
        drop(reader);
        info!(pid = ?self.pid, "PTY closed");
        result
    }
}

impl PseudoTerminal for NativePty {
    fn read(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        let reader = self.reader.snapshot()?;
        // Only concurrent readers contend on this inner lock; close never takes it.
        let mut reader = lock(&reader);
        match reader.read(buf) {
            Ok(0) => Err(PtyError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(normalize_io(e)),
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let writer = self.writer.snapshot()?;
        let mut writer = lock(&writer);
        writer.write_all(data).map_err(normalize_io)?;
        writer.flush().map_err(normalize_io)?;
        Ok(data.len())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        validate_size(cols, rows)?;
        let master = self.master.snapshot()?;
        let master = lock(&master);
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Io {
                kind: std::io::ErrorKind::Other,
                message: format!("failed to resize PTY: {e}"),
            })
    }

    fn close(&self) -> Result<(), PtyError> {
        self.closed.get_or_init(|| self.teardown()).clone()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
