//! Pane PTY - pseudo-terminal backends for multiplexer panes
//!
//! Spawns interactive processes on a native pseudo-terminal (ConPTY on
//! Windows, openpty on unix) or, when none is available, on plain pipes.
//! Every backend implements [`PseudoTerminal`]; [`Terminal`] wraps one
//! backend and adds a blocking read loop and idempotent close.
//!
//! # Example
//!
//! ```no_run
//! use pane_pty::{Terminal, TerminalConfig};
//!
//! let terminal = Terminal::start(TerminalConfig {
//!     command: "/bin/bash".to_string(),
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! terminal.write(b"echo hello\n").unwrap();
//! terminal
//!     .read_loop(|chunk| print!("{}", String::from_utf8_lossy(chunk)))
//!     .unwrap();
//! ```

mod error;
mod guarded;
pub mod pipes;
pub mod pty;
mod terminal;

pub use error::{PtyError, normalize_io};
pub use guarded::GuardedHandle;
pub use pipes::PipeProcess;
pub use pty::{
    BackendKind, BackendPreference, MAX_DIMENSION, NativePty, PseudoTerminal, TerminalConfig,
    default_shell, validate_size,
};
pub use terminal::{READ_CHUNK_SIZE, Terminal};
