//! Pane processes and their supervised read loops.

use anyhow::Context;
use pane_pty::{Terminal, TerminalConfig};
use pane_stream::{OutputBatcher, PaneSink, ReplayBuffer, Supervisor};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fallback sink: output nobody is streaming is kept for later replay.
pub struct ReplaySink {
    buffer: Mutex<ReplayBuffer>,
}

impl ReplaySink {
    pub fn new(max_bytes_per_pane: usize) -> Self {
        Self {
            buffer: Mutex::new(ReplayBuffer::new(max_bytes_per_pane)),
        }
    }

    /// Remove and return a pane's history, so it is replayed at most once.
    pub fn take(&self, pane_id: &str) -> Option<Vec<u8>> {
        let mut buffer = lock(&self.buffer);
        let history = buffer.history(pane_id);
        buffer.forget(pane_id);
        history
    }

    /// Drop the history of every pane not in `live`.
    pub fn retain(&self, live: &HashSet<String>) {
        lock(&self.buffer).retain(live);
    }
}

impl PaneSink for ReplaySink {
    fn deliver(&self, pane_id: &str, data: Vec<u8>) {
        lock(&self.buffer).push(pane_id, &data);
    }
}

struct Pane {
    id: String,
    terminal: Arc<Terminal>,
    task: JoinHandle<()>,
}

/// Every pane the daemon spawned, plus the set still alive.
pub struct PaneSet {
    panes: Vec<Pane>,
    live: Arc<Mutex<HashSet<String>>>,
    live_count: watch::Receiver<usize>,
    cancel: CancellationToken,
}

impl PaneSet {
    /// Start `count` panes named `%0`, `%1`, ... and their read loops.
    pub fn spawn(
        count: usize,
        config: &TerminalConfig,
        batcher: Arc<OutputBatcher>,
        replay: Arc<ReplaySink>,
        supervisor: Supervisor,
    ) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let live = Arc::new(Mutex::new(HashSet::new()));
        let (count_tx, live_count) = watch::channel(0usize);
        let count_tx = Arc::new(count_tx);
        let mut panes = Vec::with_capacity(count);

        for index in 0..count {
            let id = format!("%{index}");
            let terminal = Arc::new(
                Terminal::start(config.clone())
                    .with_context(|| format!("failed to start pane {id} ({})", config.command))?,
            );
            info!(
                pane_id = %id,
                pid = ?terminal.pid(),
                backend = ?terminal.backend_kind(),
                "pane started"
            );

            {
                let mut live = lock(&live);
                live.insert(id.clone());
                count_tx.send_replace(live.len());
            }

            let task = tokio::spawn(run_pane(
                PaneContext {
                    id: id.clone(),
                    terminal: terminal.clone(),
                    batcher: batcher.clone(),
                    replay: replay.clone(),
                    live: live.clone(),
                    count_tx: count_tx.clone(),
                },
                supervisor.clone(),
                cancel.clone(),
            ));
            panes.push(Pane { id, terminal, task });
        }

        Ok(Self {
            panes,
            live,
            live_count,
            cancel,
        })
    }

    pub fn live_panes(&self) -> HashSet<String> {
        lock(&self.live).clone()
    }

    /// Resolves once every pane's process has exited.
    pub async fn all_exited(&mut self) {
        let _ = self.live_count.wait_for(|n| *n == 0).await;
    }

    /// Close every terminal and wait for the read loops to wind down.
    ///
    /// Closing first lets each read loop drain to end of stream; the cancel
    /// afterwards only stops loops still waiting out a restart backoff.
    pub async fn shutdown(self) {
        let closers: Vec<_> = self
            .panes
            .iter()
            .map(|pane| {
                let terminal = pane.terminal.clone();
                let id = pane.id.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = terminal.close() {
                        warn!(pane_id = %id, error = %e, "pane did not close cleanly");
                    }
                })
            })
            .collect();
        for closer in closers {
            let _ = closer.await;
        }
        self.cancel.cancel();
        for pane in self.panes {
            let _ = pane.task.await;
        }
    }
}

struct PaneContext {
    id: String,
    terminal: Arc<Terminal>,
    batcher: Arc<OutputBatcher>,
    replay: Arc<ReplaySink>,
    live: Arc<Mutex<HashSet<String>>>,
    count_tx: Arc<watch::Sender<usize>>,
}

async fn run_pane(ctx: PaneContext, supervisor: Supervisor, cancel: CancellationToken) {
    let name = format!("pane-read {}", ctx.id);
    let outcome = supervisor
        .run(&name, &cancel, || {
            let terminal = ctx.terminal.clone();
            let batcher = ctx.batcher.clone();
            let id = ctx.id.clone();
            async move {
                let joined = tokio::task::spawn_blocking(move || {
                    terminal.read_loop(|chunk| batcher.write(&id, chunk))
                })
                .await;
                match joined {
                    Ok(result) => result.map_err(anyhow::Error::from),
                    // Hand the panic to the supervisor.
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(e) => Err(anyhow::Error::from(e)),
                }
            }
        })
        .await;

    info!(pane_id = %ctx.id, ?outcome, "pane output ended");
    let terminal = ctx.terminal.clone();
    let _ = tokio::task::spawn_blocking(move || terminal.close()).await;

    ctx.batcher.remove_pane(&ctx.id);
    let live = {
        let mut live = lock(&ctx.live);
        live.remove(&ctx.id);
        ctx.count_tx.send_replace(live.len());
        live.clone()
    };
    ctx.batcher.retain_panes(&live);
    ctx.replay.retain(&live);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
