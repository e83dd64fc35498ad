//! Per-pane output coalescing.
//!
//! Producers call [`OutputBatcher::write`] from any thread. One shared loop
//! flushes a pane when its buffer reaches `max_bytes`, when it has been
//! quiet for one `interval`, or when its oldest byte is older than
//! `max_age`. When a round flushes nothing and nothing is pending, the loop
//! backs off towards `idle_interval`; the next write wakes it back to the
//! base tick.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::BatchFileConfig;
use crate::lock;
use crate::supervisor::Supervisor;

/// Receives flushed pane output. Never called with empty data.
pub trait PaneSink: Send + Sync {
    fn deliver(&self, pane_id: &str, data: Vec<u8>);
}

impl<F> PaneSink for F
where
    F: Fn(&str, Vec<u8>) + Send + Sync,
{
    fn deliver(&self, pane_id: &str, data: Vec<u8>) {
        self(pane_id, data)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchPolicy {
    pub interval: Duration,
    pub idle_interval: Duration,
    pub max_bytes: usize,
    pub max_age: Duration,
    pub pool_capacity: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from_file(&BatchFileConfig::default())
    }
}

impl BatchPolicy {
    pub fn from_file(fc: &BatchFileConfig) -> Self {
        let interval = Duration::from_millis(fc.interval_ms.max(1));
        let max_age = Duration::from_millis(fc.max_age_ms.max(fc.max_age_floor_ms)).max(interval);
        Self {
            interval,
            idle_interval: Duration::from_millis(fc.idle_interval_ms).max(interval),
            max_bytes: fc.max_bytes.max(1),
            max_age,
            pool_capacity: fc.pool_capacity,
        }
    }
}

/// Accumulated output for one pane.
struct PaneOutputState {
    buf: Vec<u8>,
    last_write: Instant,
    pending_since: Instant,
}

struct BatchState {
    panes: HashMap<String, PaneOutputState>,
    pool: Vec<Vec<u8>>,
}

pub struct OutputBatcher {
    policy: BatchPolicy,
    sink: Arc<dyn PaneSink>,
    supervisor: Supervisor,
    state: Mutex<BatchState>,
    /// Orders deliveries between flushers so a pane's chunks never swap.
    /// Producers only take it for pass-through writes after stop.
    flush_lock: Mutex<()>,
    wake: Notify,
    idle: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OutputBatcher {
    /// Create a batcher. Its flush loop runs once [`OutputBatcher::start`] is called.
    pub fn new(policy: BatchPolicy, sink: Arc<dyn PaneSink>, supervisor: Supervisor) -> Arc<Self> {
        Arc::new(Self {
            policy,
            sink,
            supervisor,
            state: Mutex::new(BatchState {
                panes: HashMap::new(),
                pool: Vec::new(),
            }),
            flush_lock: Mutex::new(()),
            wake: Notify::new(),
            idle: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawn the flush loop. It ends when `shutdown` or [`OutputBatcher::stop`]
    /// fires, flushing every pane on the way out.
    pub fn start(self: &Arc<Self>, shutdown: &CancellationToken) {
        let mut task = lock(&self.task);
        if task.is_some() || self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let batcher = self.clone();
        let shutdown = shutdown.clone();
        *task = Some(tokio::spawn(async move {
            let cancel = batcher.cancel.clone();
            let linked = async {
                tokio::select! {
                    _ = shutdown.cancelled() => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            };
            let run = batcher.supervisor.run("output-batcher", &cancel, || {
                let batcher = batcher.clone();
                async move { batcher.run_loop().await }
            });
            let (outcome, ()) = tokio::join!(run, linked);
            debug!(?outcome, "output batcher loop ended");
            batcher.flush_all(false);
        }));
        info!(
            interval_ms = self.policy.interval.as_millis() as u64,
            max_bytes = self.policy.max_bytes,
            "output batcher started"
        );
    }

    /// Append output for a pane. Never blocks on delivery.
    pub fn write(&self, pane_id: &str, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let now = Instant::now();
        let (crossed, first_pending) = {
            let mut state = lock(&self.state);
            // Checked under the state lock: stop's final drain sees every
            // append made before the flag flipped.
            if self.stopped.load(Ordering::SeqCst) {
                drop(state);
                // Nothing will flush after stop; hand it straight through,
                // behind the final drain.
                let _order = lock(&self.flush_lock);
                self.sink.deliver(pane_id, data.to_vec());
                return;
            }
            let BatchState { panes, pool } = &mut *state;
            let pane = panes
                .entry(pane_id.to_string())
                .or_insert_with(|| PaneOutputState {
                    buf: pool.pop().unwrap_or_default(),
                    last_write: now,
                    pending_since: now,
                });
            let before = pane.buf.len();
            if before == 0 {
                pane.pending_since = now;
            }
            pane.buf.extend_from_slice(data);
            pane.last_write = now;
            (
                before < self.policy.max_bytes && pane.buf.len() >= self.policy.max_bytes,
                before == 0,
            )
        };

        if crossed || (first_pending && self.idle.load(Ordering::SeqCst)) {
            self.wake.notify_one();
        }
    }

    /// Flush and release one pane's buffer.
    pub fn remove_pane(&self, pane_id: &str) {
        let _order = lock(&self.flush_lock);
        let removed = lock(&self.state).panes.remove(pane_id);
        if let Some(pane) = removed {
            self.release(pane_id, pane);
            debug!(pane_id, "pane removed from batcher");
        }
    }

    /// Flush and release every pane not in `live`. Returns the removed pane IDs.
    pub fn retain_panes(&self, live: &HashSet<String>) -> Vec<String> {
        let _order = lock(&self.flush_lock);
        let removed: Vec<(String, PaneOutputState)> = {
            let mut state = lock(&self.state);
            let stale: Vec<String> = state
                .panes
                .keys()
                .filter(|id| !live.contains(*id))
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|id| state.panes.remove(&id).map(|pane| (id, pane)))
                .collect()
        };

        let mut ids = Vec::with_capacity(removed.len());
        for (id, pane) in removed {
            self.release(&id, pane);
            ids.push(id);
        }
        if !ids.is_empty() {
            debug!(removed = ?ids, "dropped panes no longer live");
        }
        ids
    }

    /// Stop the flush loop and flush everything still buffered.
    ///
    /// Every pending byte is delivered before this returns. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.flush_all(true);
    }

    /// Number of panes currently tracked.
    pub fn pane_count(&self) -> usize {
        lock(&self.state).panes.len()
    }

    async fn run_loop(&self) -> anyhow::Result<()> {
        let mut period = self.policy.interval;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(period) => {}
            }

            let (flushed, pending) = self.flush_due(Instant::now());
            if flushed == 0 && !pending {
                period = (period * 2).min(self.policy.idle_interval);
                self.idle.store(true, Ordering::SeqCst);
            } else {
                period = self.policy.interval;
                self.idle.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Flush every pane whose policy says it is due. Returns the number
    /// flushed and whether any pane still holds data.
    fn flush_due(&self, now: Instant) -> (usize, bool) {
        let _order = lock(&self.flush_lock);
        let mut ready = Vec::new();
        let mut pending = false;
        {
            let mut state = lock(&self.state);
            for (id, pane) in state.panes.iter_mut() {
                if pane.buf.is_empty() {
                    continue;
                }
                let due = pane.buf.len() >= self.policy.max_bytes
                    || now.duration_since(pane.last_write) >= self.policy.interval
                    || now.duration_since(pane.pending_since) >= self.policy.max_age;
                if due {
                    ready.push((id.clone(), take_chunk(&mut pane.buf, self.policy.max_bytes)));
                } else {
                    pending = true;
                }
            }
        }

        let flushed = ready.len();
        for (id, data) in ready {
            trace!(pane_id = %id, bytes = data.len(), "flushing pane output");
            self.sink.deliver(&id, data);
        }
        (flushed, pending)
    }

    /// Flush every pane. With `stopping`, the stopped flag flips under the
    /// same state lock, so later writes pass through instead of buffering.
    fn flush_all(&self, stopping: bool) {
        let _order = lock(&self.flush_lock);
        let ready: Vec<(String, Vec<u8>)> = {
            let mut state = lock(&self.state);
            if stopping {
                self.stopped.store(true, Ordering::SeqCst);
            }
            state
                .panes
                .iter_mut()
                .filter(|(_, pane)| !pane.buf.is_empty())
                .map(|(id, pane)| (id.clone(), take_chunk(&mut pane.buf, self.policy.max_bytes)))
                .collect()
        };
        for (id, data) in ready {
            self.sink.deliver(&id, data);
        }
    }

    /// Deliver a removed pane's tail and return its buffer to the pool.
    fn release(&self, pane_id: &str, mut pane: PaneOutputState) {
        if !pane.buf.is_empty() {
            self.sink.deliver(pane_id, std::mem::take(&mut pane.buf));
            return;
        }
        let mut state = lock(&self.state);
        if state.pool.len() < self.policy.pool_capacity {
            state.pool.push(pane.buf);
        }
    }
}

/// Copy out and reset a pane buffer, keeping its allocation for the next burst.
fn take_chunk(buf: &mut Vec<u8>, max_bytes: usize) -> Vec<u8> {
    let chunk = buf.clone();
    buf.clear();
    // One giant burst should not pin a huge allocation per pane forever.
    if buf.capacity() > max_bytes * 4 {
        buf.shrink_to(max_bytes);
    }
    chunk
}
