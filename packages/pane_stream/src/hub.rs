//! Single-consumer WebSocket hub for pane output.
//!
//! The hub listens on `ws://127.0.0.1:<port>/ws`. At most one consumer is
//! live at a time; a new upgrade evicts the previous consumer before it is
//! installed. Subscriptions belong to the live consumer and are cleared
//! whenever it changes.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{OnceCell, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HubFileConfig;
use crate::connection::{Outbound, serve_connection};
use crate::frame::encode_frame;
use crate::lock;
use crate::metrics::StreamMetrics;
use crate::supervisor::{LoopOutcome, Supervisor};

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Loopback port to bind; 0 lets the OS choose.
    pub port: u16,
    /// Deadline for any single socket write.
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    /// A consumer silent for this long is torn down.
    pub pong_timeout: Duration,
    /// Frames queued for the write path before the consumer counts as stuck.
    pub send_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_file(&HubFileConfig::default())
    }
}

impl HubConfig {
    pub fn from_file(fc: &HubFileConfig) -> Self {
        let ping_interval = Duration::from_secs(fc.ping_interval_secs.max(1));
        Self {
            port: fc.port,
            write_timeout: Duration::from_millis(fc.write_timeout_ms.max(1)),
            ping_interval,
            pong_timeout: Duration::from_secs(fc.pong_timeout_secs).max(ping_interval),
            send_queue_capacity: fc.send_queue_capacity.max(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("stream hub was already started")]
    AlreadyStarted,

    #[error("failed to bind loopback listener: {0}")]
    Bind(String),

    #[error("stream hub server failed: {0}")]
    Serve(String),

    #[error("stream hub was never started")]
    NotStarted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubState {
    Idle,
    Connected,
    Draining,
    Closed,
}

/// Lifecycle notifications, emitted after the change is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubEvent {
    Connected { conn_id: u64 },
    Disconnected { conn_id: u64, reason: String },
    /// Panes that became subscribed (already-subscribed IDs are omitted).
    Subscribed { pane_ids: Vec<String> },
    /// Panes that stopped being subscribed.
    Unsubscribed { pane_ids: Vec<String> },
}

/// The live consumer's handle, as seen by everything outside its pumps.
pub(crate) struct LiveConnection {
    pub(crate) id: u64,
    pub(crate) outbound: mpsc::Sender<Outbound>,
    pub(crate) cancel: CancellationToken,
    /// Cancelled once the connection's pumps have all exited.
    pub(crate) finished: CancellationToken,
}

/// State shared by the hub handle, the upgrade handler and connection pumps.
pub(crate) struct HubShared {
    pub(crate) config: HubConfig,
    pub(crate) supervisor: Supervisor,
    pub(crate) metrics: StreamMetrics,
    /// Lock order: `connection` before `subscriptions`.
    connection: Mutex<Option<LiveConnection>>,
    subscriptions: Mutex<HashSet<String>>,
    next_conn_id: AtomicU64,
    draining: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<HubEvent>,
    cancel: OnceLock<CancellationToken>,
}

impl HubShared {
    /// Token for a new connection's pumps; a child of the hub's run token.
    pub(crate) fn connection_token(&self) -> CancellationToken {
        self.cancel
            .get()
            .map(CancellationToken::child_token)
            .unwrap_or_default()
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Install `live` as the sole consumer, closing any previous one first.
    pub(crate) fn attach(&self, live: LiveConnection) {
        let conn_id = live.id;
        let evicted = {
            let mut connection = lock(&self.connection);
            let evicted = connection.take();
            if let Some(old) = &evicted {
                old.cancel.cancel();
            }
            lock(&self.subscriptions).clear();
            *connection = Some(live);
            evicted
        };

        self.metrics.connection_opened(evicted.is_some());
        if let Some(old) = evicted {
            info!(conn_id, replaced = old.id, "consumer replaced previous connection");
            self.emit(HubEvent::Disconnected {
                conn_id: old.id,
                reason: "replaced by a new connection".into(),
            });
        } else {
            info!(conn_id, "consumer connected");
        }
        self.emit(HubEvent::Connected { conn_id });
    }

    /// Tear down connection `conn_id` if it is still the live one.
    pub(crate) fn drop_connection(&self, conn_id: u64, reason: &str) -> bool {
        let removed = {
            let mut connection = lock(&self.connection);
            if connection.as_ref().map(|c| c.id) != Some(conn_id) {
                return false;
            }
            lock(&self.subscriptions).clear();
            connection.take()
        };

        if let Some(live) = removed {
            live.cancel.cancel();
            info!(conn_id, reason, "consumer disconnected");
            self.emit(HubEvent::Disconnected {
                conn_id,
                reason: reason.to_string(),
            });
        }
        true
    }

    /// Apply a subscribe/unsubscribe from connection `conn_id`. Requests
    /// from a connection that is no longer live are ignored.
    pub(crate) fn update_subscriptions(&self, conn_id: u64, pane_ids: Vec<String>, subscribe: bool) {
        let changed: Vec<String> = {
            let connection = lock(&self.connection);
            if connection.as_ref().map(|c| c.id) != Some(conn_id) {
                return;
            }
            let mut subscriptions = lock(&self.subscriptions);
            pane_ids
                .into_iter()
                .filter(|id| {
                    if subscribe {
                        subscriptions.insert(id.clone())
                    } else {
                        subscriptions.remove(id)
                    }
                })
                .collect()
        };

        if changed.is_empty() {
            return;
        }
        debug!(conn_id, subscribe, panes = ?changed, "subscriptions updated");
        self.emit(if subscribe {
            HubEvent::Subscribed { pane_ids: changed }
        } else {
            HubEvent::Unsubscribed { pane_ids: changed }
        });
    }

    fn emit(&self, event: HubEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

struct RunState {
    cancel: CancellationToken,
    server: JoinHandle<LoopOutcome>,
    addr: SocketAddr,
}

/// Streams batched pane output to one WebSocket consumer.
pub struct StreamHub {
    shared: Arc<HubShared>,
    run: Mutex<Option<RunState>>,
    started: AtomicBool,
    stopped: OnceCell<Result<(), HubError>>,
}

impl StreamHub {
    pub fn new(config: HubConfig, supervisor: Supervisor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(HubShared {
                config,
                supervisor,
                metrics: StreamMetrics::new(),
                connection: Mutex::new(None),
                subscriptions: Mutex::new(HashSet::new()),
                next_conn_id: AtomicU64::new(0),
                draining: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events,
                cancel: OnceLock::new(),
            }),
            run: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: OnceCell::new(),
        }
    }

    /// Bind the loopback listener and start accepting consumers.
    ///
    /// The address is resolved before this returns, so [`StreamHub::url`]
    /// is immediately usable. Cancelling `shutdown` stops accepting and
    /// closes the live consumer.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), HubError> {
        if self.stopped.initialized() || self.started.swap(true, Ordering::SeqCst) {
            return Err(HubError::AlreadyStarted);
        }

        let bind = SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.shared.config.port);
        let listener = std::net::TcpListener::bind(bind)
            .and_then(|l| l.set_nonblocking(true).map(|()| l))
            .map_err(|e| HubError::Bind(format!("{bind}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| HubError::Bind(e.to_string()))?;
        let listener = Arc::new(listener);

        let cancel = shutdown.child_token();
        let _ = self.shared.cancel.set(cancel.clone());

        let router = Router::new()
            .route("/ws", get(ws_upgrade))
            .with_state(self.shared.clone());

        let shared = self.shared.clone();
        let supervisor = self.shared.supervisor.clone();
        let accept_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            let outcome = supervisor
                .run("hub-accept", &accept_cancel, || {
                    let listener = listener.clone();
                    let router = router.clone();
                    let cancel = accept_cancel.clone();
                    async move {
                        let std_listener = listener.try_clone()?;
                        std_listener.set_nonblocking(true)?;
                        let listener = tokio::net::TcpListener::from_std(std_listener)?;
                        axum::serve(listener, router)
                            .with_graceful_shutdown(cancel.cancelled_owned())
                            .await?;
                        anyhow::Ok(())
                    }
                })
                .await;
            if outcome == LoopOutcome::Exhausted {
                error!("hub accept loop gave up; no new consumers will be accepted");
            }
            // The listener is gone either way.
            shared.closed.store(true, Ordering::SeqCst);
            outcome
        });

        *lock(&self.run) = Some(RunState {
            cancel,
            server,
            addr,
        });
        info!(url = %format!("ws://{addr}/ws"), "stream hub listening");
        Ok(())
    }

    /// Stop accepting, close the live consumer with a close frame, then
    /// release the listener. Later calls return the first call's result.
    pub async fn stop(&self) -> Result<(), HubError> {
        self.stopped.get_or_init(|| self.shutdown()).await.clone()
    }

    async fn shutdown(&self) -> Result<(), HubError> {
        let run = lock(&self.run).take();
        let Some(run) = run else {
            self.shared.closed.store(true, Ordering::SeqCst);
            return Err(HubError::NotStarted);
        };

        self.shared.draining.store(true, Ordering::SeqCst);
        info!("stream hub draining");

        let live = lock(&self.shared.connection)
            .as_ref()
            .map(|c| (c.id, c.finished.clone()));
        if let Some((conn_id, finished)) = live {
            self.shared.drop_connection(conn_id, "hub stopping");
            // Give the write pump a chance to deliver the close frame.
            let grace = self.shared.config.write_timeout + Duration::from_millis(100);
            if tokio::time::timeout(grace, finished.cancelled()).await.is_err() {
                warn!(conn_id, "consumer did not finish closing before shutdown");
            }
        }

        run.cancel.cancel();
        let result = match run.server.await {
            Ok(_) => Ok(()),
            Err(e) => Err(HubError::Serve(e.to_string())),
        };
        self.shared.closed.store(true, Ordering::SeqCst);
        info!(addr = %run.addr, "stream hub stopped");
        result
    }

    /// `ws://127.0.0.1:<port>/ws` while the hub is accepting.
    pub fn url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("ws://{addr}/ws"))
    }

    /// The bound address; `None` before start and once the listener is released.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        lock(&self.run).as_ref().map(|run| run.addr)
    }

    /// Send one pane's output to the consumer if it subscribed to the pane.
    ///
    /// A no-op when nobody is connected, the pane is not subscribed, or
    /// `data` is empty. Never blocks: when the consumer's queue is full the
    /// frame is dropped and the consumer is disconnected.
    pub fn broadcast_pane_data(&self, pane_id: &str, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some((conn_id, outbound)) = lock(&self.shared.connection)
            .as_ref()
            .map(|c| (c.id, c.outbound.clone()))
        else {
            return;
        };
        if !self.is_subscribed(pane_id) {
            return;
        }

        let frame = Outbound::Frame {
            bytes: encode_frame(pane_id, data),
            data_len: data.len(),
        };
        match outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.metrics.frame_dropped();
                warn!(
                    conn_id,
                    pane_id,
                    bytes = data.len(),
                    "consumer send queue full; dropping frame and disconnecting"
                );
                self.shared.drop_connection(conn_id, "send queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id, pane_id, "consumer already closing; frame skipped");
            }
        }
    }

    pub fn has_active_connection(&self) -> bool {
        lock(&self.shared.connection).is_some()
    }

    pub fn is_subscribed(&self, pane_id: &str) -> bool {
        lock(&self.shared.subscriptions).contains(pane_id)
    }

    pub fn state(&self) -> HubState {
        if self.shared.closed.load(Ordering::SeqCst) {
            HubState::Closed
        } else if self.shared.is_draining() {
            HubState::Draining
        } else if self.has_active_connection() {
            HubState::Connected
        } else {
            HubState::Idle
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.shared.events.subscribe()
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.shared.metrics
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(shared): State<Arc<HubShared>>) -> Response {
    if shared.is_draining() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| serve_connection(shared, socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_file_clamps() {
        let config = HubConfig::from_file(&HubFileConfig {
            ping_interval_secs: 10,
            pong_timeout_secs: 2,
            send_queue_capacity: 0,
            ..Default::default()
        });
        assert_eq!(config.pong_timeout, Duration::from_secs(10));
        assert_eq!(config.send_queue_capacity, 1);
        assert_eq!(config.write_timeout, Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn idle_hub_broadcast_is_a_noop() {
        let hub = StreamHub::new(HubConfig::default(), Supervisor::default());
        assert_eq!(hub.url(), None);
        assert_eq!(hub.state(), HubState::Idle);
        hub.broadcast_pane_data("%0", b"nobody listening");
        hub.broadcast_pane_data("%0", b"");
        assert!(!hub.has_active_connection());
        assert_eq!(hub.metrics().snapshot().frames.dropped, 0);
    }

    #[tokio::test]
    async fn stop_without_start_is_cached() {
        let hub = StreamHub::new(HubConfig::default(), Supervisor::default());
        assert_eq!(hub.stop().await, Err(HubError::NotStarted));
        assert_eq!(hub.stop().await, Err(HubError::NotStarted));
        assert_eq!(hub.state(), HubState::Closed);
        assert_eq!(
            hub.start(CancellationToken::new()).await,
            Err(HubError::AlreadyStarted)
        );
    }

    #[tokio::test]
    async fn start_resolves_loopback_url() {
        let hub = StreamHub::new(HubConfig::default(), Supervisor::default());
        hub.start(CancellationToken::new()).await.unwrap();
        let addr = hub.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(hub.url().unwrap(), format!("ws://127.0.0.1:{}/ws", addr.port()));
        assert_eq!(
            hub.start(CancellationToken::new()).await,
            Err(HubError::AlreadyStarted)
        );
        assert_eq!(hub.stop().await, Ok(()));
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = StreamHub::new(HubConfig::default(), Supervisor::default());
        first.start(CancellationToken::new()).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let second = StreamHub::new(
            HubConfig {
                port,
                ..HubConfig::default()
            },
            Supervisor::default(),
        );
        let err = second.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HubError::Bind(_)), "{err}");
        first.stop().await.unwrap();
    }

    #[test]
    fn subscriptions_only_apply_to_live_connection() {
        let hub = StreamHub::new(HubConfig::default(), Supervisor::default());
        let mut events = hub.subscribe_events();
        let (tx, _rx) = mpsc::channel(4);
        hub.shared.attach(LiveConnection {
            id: 7,
            outbound: tx,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        hub.shared.update_subscriptions(7, vec!["%0".into(), "%1".into()], true);
        hub.shared.update_subscriptions(99, vec!["%2".into()], true);
        assert!(hub.is_subscribed("%0"));
        assert!(!hub.is_subscribed("%2"));

        hub.shared.update_subscriptions(7, vec!["%0".into()], true);
        hub.shared.update_subscriptions(7, vec!["%1".into()], false);
        assert!(!hub.is_subscribed("%1"));

        assert_eq!(events.try_recv().unwrap(), HubEvent::Connected { conn_id: 7 });
        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::Subscribed {
                pane_ids: vec!["%0".into(), "%1".into()]
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::Unsubscribed {
                pane_ids: vec!["%1".into()]
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_frame_and_consumer() {
        let hub = StreamHub::new(HubConfig::default(), Supervisor::default());
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        hub.shared.attach(LiveConnection {
            id: 1,
            outbound: tx,
            cancel: cancel.clone(),
            finished: CancellationToken::new(),
        });
        hub.shared.update_subscriptions(1, vec!["%0".into()], true);

        hub.broadcast_pane_data("%0", b"fits");
        assert!(hub.has_active_connection());
        hub.broadcast_pane_data("%0", b"overflows");

        assert!(!hub.has_active_connection());
        assert!(cancel.is_cancelled());
        assert!(!hub.is_subscribed("%0"));
        assert_eq!(hub.metrics().snapshot().frames.dropped, 1);
    }

    #[test]
    fn replacement_cancels_previous_and_clears_subscriptions() {
        let hub = StreamHub::new(HubConfig::default(), Supervisor::default());
        let first = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(4);
        hub.shared.attach(LiveConnection {
            id: 1,
            outbound: tx.clone(),
            cancel: first.clone(),
            finished: CancellationToken::new(),
        });
        hub.shared.update_subscriptions(1, vec!["%0".into()], true);

        hub.shared.attach(LiveConnection {
            id: 2,
            outbound: tx,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        });
        assert!(first.is_cancelled());
        assert!(!hub.is_subscribed("%0"));
        // The evicted connection's own teardown must not disturb the new one.
        assert!(!hub.shared.drop_connection(1, "late teardown"));
        assert!(hub.has_active_connection());
        assert_eq!(hub.metrics().snapshot().connections.replaced, 1);
    }
}
