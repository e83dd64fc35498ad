//! Pane Stream - output batching and single-consumer streaming
//!
//! Pane output flows `Terminal` read loop → [`OutputBatcher::write`] →
//! flush → [`HubRoute`] → [`StreamHub::broadcast_pane_data`] → one binary
//! WebSocket frame per flush. The consumer picks panes with JSON
//! subscribe/unsubscribe messages on the same socket.
//!
//! Every long-lived loop here runs under a [`Supervisor`], which restarts it
//! with backoff after a panic or error.

mod batcher;
pub mod config;
mod connection;
pub mod control;
pub mod frame;
mod hub;
pub mod metrics;
pub mod replay_buffer;
mod route;
pub mod supervisor;

pub use batcher::{BatchPolicy, OutputBatcher, PaneSink};
pub use config::StreamFileConfig;
pub use frame::{FrameError, decode_frame, encode_frame};
pub use hub::{HubConfig, HubError, HubEvent, HubState, StreamHub};
pub use metrics::{MetricsSnapshot, StreamMetrics};
pub use replay_buffer::ReplayBuffer;
pub use route::HubRoute;
pub use supervisor::{LoopOutcome, RestartPolicy, SupervisorEvent, Supervisor};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a panicking loop poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
