use std::io;

/// Errors that can occur during pseudo-terminal operations.
///
/// Every OS failure that means "the other side is gone" collapses into
/// [`PtyError::Closed`], so callers never match on platform error codes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PtyError {
    /// The handle was closed, the process exited, or the pipe broke.
    #[error("terminal closed")]
    Closed,

    /// Resize dimensions outside `1..=32767`.
    #[error("invalid terminal size {cols}x{rows} (each dimension must be 1..=32767)")]
    InvalidSize { cols: u16, rows: u16 },

    /// Failed to create the terminal or spawn its process.
    #[error("failed to spawn terminal: {0}")]
    Spawn(String),

    /// An OS error unrelated to closure, passed through unchanged.
    #[error("terminal I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    /// The backend cannot perform this operation.
    #[error("unsupported by this backend: {0}")]
    Unsupported(&'static str),
}

impl PtyError {
    pub fn is_closed(&self) -> bool {
        matches!(self, PtyError::Closed)
    }
}

impl From<io::Error> for PtyError {
    fn from(err: io::Error) -> Self {
        normalize_io(err)
    }
}

/// Map an OS error into a [`PtyError`], folding the broken-pipe,
/// invalid-handle and no-data families into [`PtyError::Closed`].
pub fn normalize_io(err: io::Error) -> PtyError {
    if is_closed_error(&err) {
        return PtyError::Closed;
    }
    PtyError::Io {
        kind: err.kind(),
        message: err.to_string(),
    }
}

fn is_closed_error(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        BrokenPipe | UnexpectedEof | ConnectionReset | ConnectionAborted | NotConnected
    ) {
        return true;
    }

    match err.raw_os_error() {
        Some(code) => is_closed_os_code(code),
        None => false,
    }
}

#[cfg(unix)]
fn is_closed_os_code(code: i32) -> bool {
    use nix::errno::Errno;

    // Reading a pty master after the slave side hangs up yields EIO on Linux.
    [Errno::EIO, Errno::EBADF, Errno::EPIPE]
        .iter()
        .any(|errno| *errno as i32 == code)
}

#[cfg(windows)]
fn is_closed_os_code(code: i32) -> bool {
    const ERROR_INVALID_HANDLE: i32 = 6;
    const ERROR_BROKEN_PIPE: i32 = 109;
    const ERROR_NO_DATA: i32 = 232;
    const ERROR_PIPE_NOT_CONNECTED: i32 = 233;

    matches!(
        code,
        ERROR_INVALID_HANDLE | ERROR_BROKEN_PIPE | ERROR_NO_DATA | ERROR_PIPE_NOT_CONNECTED
    )
}

#[cfg(not(any(unix, windows)))]
fn is_closed_os_code(_code: i32) -> bool {
    false
}
