use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};

use crate::error::PtyError;
use crate::pipes::PipeProcess;
use crate::pty::{BackendKind, BackendPreference, NativePty, PseudoTerminal, TerminalConfig, lock};

/// Size of each read issued by [`Terminal::read_loop`].
pub const READ_CHUNK_SIZE: usize = 4096;

enum Backend {
    Native(NativePty),
    Pipes(PipeProcess),
}

impl Backend {
    fn as_pty(&self) -> &dyn PseudoTerminal {
        match self {
            Backend::Native(pty) => pty,
            Backend::Pipes(pipes) => pipes,
        }
    }
}

/// One pane's process, owned exclusively by whoever holds the terminal.
///
/// Share it behind an `Arc` to run [`Terminal::read_loop`] on one thread
/// while another writes, resizes, or closes.
pub struct Terminal {
    backend: Backend,
    command: String,
    closed: OnceLock<Result<(), PtyError>>,
}

impl Terminal {
    /// Spawn the configured process on the preferred backend.
    pub fn start(config: TerminalConfig) -> Result<Self, PtyError> {
        let backend = match config.backend {
            BackendPreference::Native => Backend::Native(NativePty::spawn(&config)?),
            BackendPreference::Pipes => Backend::Pipes(PipeProcess::spawn(&config)?),
            BackendPreference::Auto => match NativePty::spawn(&config) {
                Ok(pty) => Backend::Native(pty),
                // A bad size is the caller's mistake; pipes would not fix it.
                Err(e @ PtyError::InvalidSize { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        "Native PTY unavailable for '{}' ({}), falling back to pipes",
                        config.command, e
                    );
                    Backend::Pipes(PipeProcess::spawn(&config)?)
                }
            },
        };

        Ok(Self {
            backend,
            command: config.command,
            closed: OnceLock::new(),
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self.backend {
            Backend::Native(_) => BackendKind::Native,
            Backend::Pipes(_) => BackendKind::Pipes,
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        self.backend.as_pty().read(buf)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        self.backend.as_pty().write(data)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.backend.as_pty().resize(cols, rows)
    }

    pub fn pid(&self) -> Option<u32> {
        self.backend.as_pty().pid()
    }

    /// Close the process. Idempotent: every call returns the first result.
    pub fn close(&self) -> Result<(), PtyError> {
        self.closed
            .get_or_init(|| {
                info!(command = %self.command, pid = ?self.pid(), "closing terminal");
                self.backend.as_pty().close()
            })
            .clone()
    }

    /// Block until the process output ends, handing every non-empty chunk to `sink`.
    ///
    /// End of stream and closure both return `Ok(())`; any other error is
    /// returned after the loop stops. With the pipe backend, stdout and
    /// stderr are drained by separate threads that are joined before this
    /// returns.
    pub fn read_loop<F>(&self, sink: F) -> Result<(), PtyError>
    where
        F: FnMut(&[u8]) + Send,
    {
        match &self.backend {
            Backend::Native(pty) => drain(|buf| pty.read(buf), sink),
            Backend::Pipes(pipes) => {
                let sink = Mutex::new(sink);
                let forward = |chunk: &[u8]| {
                    let mut sink = lock(&sink);
                    (*sink)(chunk)
                };
                std::thread::scope(|scope| {
                    let stderr = scope.spawn(|| drain(|buf| pipes.read_stderr(buf), forward));
                    let stdout = drain(|buf| pipes.read(buf), forward);
                    let stderr = stderr.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                    stdout.and(stderr)
                })
            }
        }
    }
}

fn drain(
    mut read: impl FnMut(&mut [u8]) -> Result<usize, PtyError>,
    mut sink: impl FnMut(&[u8]),
) -> Result<(), PtyError> {
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match read(&mut buffer) {
            Ok(0) => continue,
            Ok(n) => sink(&buffer[..n]),
            Err(PtyError::Closed) => {
                debug!("terminal output reached EOF");
                return Ok(());
            }
            Err(e) => {
                warn!("Error reading terminal output: {}", e);
                return Err(e);
            }
        }
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_stops_on_closed_and_skips_empty_reads() {
        let mut script = vec![Ok(3), Ok(0), Ok(2), Err(PtyError::Closed)].into_iter();
        let mut chunks = Vec::new();
        let result = drain(
            |buf| {
                let next = script.next().unwrap_or(Err(PtyError::Closed));
                if let Ok(n) = next {
                    buf[..n].fill(b'x');
                }
                next
            },
            |chunk| chunks.push(chunk.len()),
        );
        assert!(result.is_ok());
        assert_eq!(chunks, vec![3, 2]);
    }

    #[test]
    fn drain_surfaces_unrelated_errors() {
        let err = PtyError::Io {
            kind: std::io::ErrorKind::PermissionDenied,
            message: "denied".into(),
        };
        let expected = err.clone();
        let mut first = Some(err);
        let result = drain(
            |_| Err(first.take().unwrap_or(PtyError::Closed)),
            |_| panic!("no data expected"),
        );
        assert_eq!(result, Err(expected));
    }
}
