use anyhow::{Context, Result, bail};
use clap::Parser;
use pane_stream::{
    BatchPolicy, HubConfig, HubEvent, HubRoute, OutputBatcher, RestartPolicy, StreamHub,
    Supervisor, SupervisorEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

mod config;
mod panes;

use crate::config::{BackendChoice, DEFAULT_CONFIG_FILE, FileConfig, load_config};
use crate::panes::{PaneSet, ReplaySink};

#[derive(Parser, Debug)]
#[command(name = "panemux")]
#[command(about = "Spawn shell panes and stream their output over a loopback WebSocket")]
struct Args {
    /// Config file (defaults to ./panemux.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of panes to spawn
    #[arg(short = 'n', long)]
    panes: Option<usize>,

    /// Port for the stream hub (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Terminal backend for new panes
    #[arg(long, value_enum)]
    backend: Option<BackendChoice>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Command and arguments to run in each pane
    #[arg(last = true)]
    command: Vec<String>,
}

impl Args {
    /// CLI flags win over config file and environment.
    fn apply(&self, fc: &mut FileConfig) {
        if let Some(count) = self.panes {
            fc.panes.count = count;
        }
        if let Some(port) = self.port {
            fc.hub.port = port;
        }
        if let Some(backend) = self.backend {
            fc.panes.backend = backend;
        }
        if let Some((command, args)) = self.command.split_first() {
            fc.panes.command = Some(command.clone());
            fc.panes.args = args.to_vec();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "panemux=debug,pane_stream=debug,pane_pty=debug,info"
    } else {
        "panemux=info,pane_stream=info,pane_pty=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if args.config.is_some() && !config_path.exists() {
        bail!("config file {} does not exist", config_path.display());
    }
    let mut fc: FileConfig = load_config(&config_path)
        .extract()
        .with_context(|| format!("invalid configuration ({})", config_path.display()))?;
    args.apply(&mut fc);

    run(fc).await
}

async fn run(fc: FileConfig) -> Result<()> {
    if fc.panes.count == 0 {
        bail!("at least one pane is required");
    }
    info!(panes = fc.panes.count, "starting panemux");

    let shutdown = CancellationToken::new();
    let (supervisor_tx, mut supervisor_rx) = mpsc::unbounded_channel();
    let supervisor =
        Supervisor::new(RestartPolicy::from_file(&fc.supervisor)).with_events(supervisor_tx);

    let hub = Arc::new(StreamHub::new(HubConfig::from_file(&fc.hub), supervisor.clone()));
    hub.start(shutdown.clone())
        .await
        .context("failed to start stream hub")?;
    let url = hub.url().context("stream hub has no address")?;
    // The URL is the one line on stdout; consumers read it to connect.
    println!("{url}");

    let replay = Arc::new(ReplaySink::new(fc.panes.replay_bytes()));
    let route = Arc::new(HubRoute::new(hub.clone(), replay.clone()));
    let batcher = OutputBatcher::new(BatchPolicy::from_file(&fc.batch), route, supervisor.clone());
    batcher.start(&shutdown);

    let replay_task = tokio::spawn(replay_on_subscribe(
        hub.subscribe_events(),
        hub.clone(),
        replay.clone(),
        shutdown.clone(),
    ));

    let mut panes = PaneSet::spawn(
        fc.panes.count,
        &fc.panes.terminal_config(),
        batcher.clone(),
        replay,
        supervisor,
    )
    .context("failed to spawn panes")?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            info!("received shutdown signal, cleaning up");
        }
        Some((name, reason)) = next_fatal(&mut supervisor_rx) => {
            error!(loop_name = %name, reason = %reason, "supervised loop gave up, shutting down");
        }
        _ = panes.all_exited() => {
            info!("all panes exited");
        }
    }

    // Panes first so their last output still reaches the consumer.
    info!(live = panes.live_panes().len(), "stopping panes");
    panes.shutdown().await;
    batcher.stop().await;
    let stopped = hub.stop().await;
    shutdown.cancel();
    let _ = replay_task.await;

    match serde_json::to_string(&hub.metrics().snapshot()) {
        Ok(metrics) => info!(%metrics, "final stream metrics"),
        Err(e) => warn!("Failed to serialize metrics: {}", e),
    }
    stopped.context("stream hub did not stop cleanly")?;
    info!("shutdown complete");
    Ok(())
}

/// Wait for the first fatal supervisor event; restarts are already logged.
async fn next_fatal(events: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> Option<(String, String)> {
    while let Some(event) = events.recv().await {
        if let SupervisorEvent::Fatal { name, reason } = event {
            return Some((name, reason));
        }
    }
    None
}

/// Send a pane's missed output when the consumer subscribes to it.
async fn replay_on_subscribe(
    mut events: broadcast::Receiver<HubEvent>,
    hub: Arc<StreamHub>,
    replay: Arc<ReplaySink>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(HubEvent::Subscribed { pane_ids }) => {
                for pane_id in pane_ids {
                    if let Some(history) = replay.take(&pane_id) {
                        debug!(pane_id = %pane_id, bytes = history.len(), "replaying missed output");
                        hub.broadcast_pane_data(&pane_id, &history);
                    }
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Hub event stream lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pane_stream::PaneSink;

    #[test]
    fn cli_overrides_config() {
        let args = Args::try_parse_from([
            "panemux", "-n", "4", "--port", "7681", "--backend", "pipes", "--", "bash", "-l",
        ])
        .unwrap();
        let mut fc = FileConfig::default();
        args.apply(&mut fc);

        assert_eq!(fc.panes.count, 4);
        assert_eq!(fc.hub.port, 7681);
        assert_eq!(fc.panes.backend, BackendChoice::Pipes);
        assert_eq!(fc.panes.command.as_deref(), Some("bash"));
        assert_eq!(fc.panes.args, vec!["-l".to_string()]);
    }

    #[test]
    fn absent_flags_keep_config() {
        let args = Args::try_parse_from(["panemux"]).unwrap();
        let mut fc = FileConfig::default();
        fc.panes.count = 2;
        fc.panes.command = Some("zsh".into());
        args.apply(&mut fc);

        assert_eq!(fc.panes.count, 2);
        assert_eq!(fc.panes.command.as_deref(), Some("zsh"));
        assert!(!args.debug);
    }

    #[tokio::test]
    async fn fatal_events_are_picked_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SupervisorEvent::Restarted {
            name: "hub-read".into(),
            attempt: 1,
            reason: "boom".into(),
        })
        .unwrap();
        tx.send(SupervisorEvent::Fatal {
            name: "output-batcher".into(),
            reason: "too many panics".into(),
        })
        .unwrap();
        drop(tx);

        assert_eq!(
            next_fatal(&mut rx).await,
            Some(("output-batcher".to_string(), "too many panics".to_string()))
        );
        assert_eq!(next_fatal(&mut rx).await, None);
    }

    #[tokio::test]
    async fn subscribed_panes_get_missed_output_once() {
        let hub = Arc::new(StreamHub::new(HubConfig::default(), Supervisor::default()));
        let replay = Arc::new(ReplaySink::new(1024));
        replay.deliver("%0", b"missed".to_vec());

        let (tx, rx) = broadcast::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(replay_on_subscribe(rx, hub, replay.clone(), cancel.clone()));

        tx.send(HubEvent::Subscribed {
            pane_ids: vec!["%0".into()],
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(replay.take("%0"), None);
    }
}
