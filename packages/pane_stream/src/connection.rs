//! Pumps for one upgraded consumer connection.
//!
//! Three supervised loops share the socket: the read pump parses control
//! messages, the write pump owns the sink and is the only writer, and the
//! keepalive loop pings and enforces the silence deadline. Whichever loop
//! sees the connection die cancels the others; a close frame goes out once
//! all three have stopped.

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control::{ControlRequest, ServerNotice, parse_control};
use crate::hub::{HubShared, LiveConnection};
use crate::lock;

/// Work queued for the write pump.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame { bytes: Vec<u8>, data_len: usize },
    Text(String),
    Ping,
}

struct ConnectionIo {
    conn_id: u64,
    sink: AsyncMutex<SplitSink<WebSocket, Message>>,
    stream: AsyncMutex<SplitStream<WebSocket>>,
    outbound_rx: AsyncMutex<mpsc::Receiver<Outbound>>,
    outbound: mpsc::Sender<Outbound>,
    last_inbound: Mutex<Instant>,
    end_reason: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl ConnectionIo {
    /// Record why the connection ended (first reason wins) and stop every pump.
    fn end(&self, reason: impl Into<String>) {
        {
            let mut slot = lock(&self.end_reason);
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.cancel.cancel();
    }
}

pub(crate) async fn serve_connection(shared: Arc<HubShared>, socket: WebSocket) {
    if shared.is_draining() {
        return;
    }

    let conn_id = shared.next_conn_id();
    let cancel = shared.connection_token();
    let finished = CancellationToken::new();
    let (outbound, outbound_rx) = mpsc::channel(shared.config.send_queue_capacity);

    shared.attach(LiveConnection {
        id: conn_id,
        outbound: outbound.clone(),
        cancel: cancel.clone(),
        finished: finished.clone(),
    });

    let (sink, stream) = socket.split();
    let io = Arc::new(ConnectionIo {
        conn_id,
        sink: AsyncMutex::new(sink),
        stream: AsyncMutex::new(stream),
        outbound_rx: AsyncMutex::new(outbound_rx),
        outbound,
        last_inbound: Mutex::new(Instant::now()),
        end_reason: Mutex::new(None),
        cancel: cancel.clone(),
    });

    let supervisor = shared.supervisor.clone();
    let read = async {
        let outcome = supervisor
            .run("hub-read", &cancel, || read_pump(shared.clone(), io.clone()))
            .await;
        io.end(format!("read pump ended ({outcome:?})"));
    };
    let write = async {
        let outcome = supervisor
            .run("hub-write", &cancel, || write_pump(shared.clone(), io.clone()))
            .await;
        io.end(format!("write pump ended ({outcome:?})"));
    };
    let keepalive = async {
        let outcome = supervisor
            .run("hub-keepalive", &cancel, || keepalive(shared.clone(), io.clone()))
            .await;
        io.end(format!("keepalive ended ({outcome:?})"));
    };
    tokio::join!(read, write, keepalive);

    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "hub closing connection".into(),
    }));
    let mut sink = io.sink.lock().await;
    let _ = tokio::time::timeout(shared.config.write_timeout, sink.send(close)).await;
    drop(sink);

    let reason = lock(&io.end_reason)
        .take()
        .unwrap_or_else(|| "closed".to_string());
    shared.drop_connection(conn_id, &reason);
    finished.cancel();
    debug!(conn_id, reason = %reason, "connection pumps exited");
}

async fn read_pump(shared: Arc<HubShared>, io: Arc<ConnectionIo>) -> anyhow::Result<()> {
    let mut stream = io.stream.lock().await;
    loop {
        let next = tokio::select! {
            _ = io.cancel.cancelled() => return Ok(()),
            next = stream.next() => next,
        };
        let msg = match next {
            None => {
                io.end("peer went away");
                return Ok(());
            }
            Some(Err(e)) => {
                io.end(format!("read failed: {e}"));
                return Ok(());
            }
            Some(Ok(msg)) => msg,
        };

        *lock(&io.last_inbound) = Instant::now();
        match msg {
            Message::Text(text) => handle_control(&shared, &io, text.as_str()),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("peer closed ({})", f.code))
                    .unwrap_or_else(|| "peer closed".to_string());
                io.end(reason);
                return Ok(());
            }
            Message::Binary(data) => {
                debug!(conn_id = io.conn_id, bytes = data.len(), "ignoring inbound binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

fn handle_control(shared: &HubShared, io: &ConnectionIo, text: &str) {
    let parsed = match parse_control(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            shared.metrics.control_error();
            warn!(conn_id = io.conn_id, error = %err, "rejected control message");
            let notice = ServerNotice::from(&err).to_json();
            if io.outbound.try_send(Outbound::Text(notice)).is_err() {
                debug!(conn_id = io.conn_id, "error notice not queued");
            }
            return;
        }
    };

    if parsed.rejected > 0 {
        warn!(
            conn_id = io.conn_id,
            rejected = parsed.rejected,
            "ignored empty pane IDs in control message"
        );
    }
    match parsed.request {
        ControlRequest::Subscribe(ids) => shared.update_subscriptions(io.conn_id, ids, true),
        ControlRequest::Unsubscribe(ids) => shared.update_subscriptions(io.conn_id, ids, false),
        ControlRequest::Unknown(action) => {
            warn!(conn_id = io.conn_id, action = %action, "ignoring unknown control action");
        }
    }
}

async fn write_pump(shared: Arc<HubShared>, io: Arc<ConnectionIo>) -> anyhow::Result<()> {
    let write_timeout = shared.config.write_timeout;
    let mut outbound = io.outbound_rx.lock().await;
    let mut sink = io.sink.lock().await;

    loop {
        let next = tokio::select! {
            biased;
            _ = io.cancel.cancelled() => None,
            next = outbound.recv() => next,
        };
        let Some(next) = next else {
            return Ok(());
        };

        let (msg, data_len) = match next {
            Outbound::Frame { bytes, data_len } => (Message::Binary(Bytes::from(bytes)), Some(data_len)),
            Outbound::Text(text) => (Message::Text(text.into()), None),
            Outbound::Ping => (Message::Ping(Bytes::new()), None),
        };
        match tokio::time::timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {
                if let Some(len) = data_len {
                    shared.metrics.frame_sent(len);
                }
            }
            Ok(Err(e)) => {
                io.end(format!("write failed: {e}"));
                return Ok(());
            }
            Err(_) => {
                shared.metrics.write_timeout();
                warn!(
                    conn_id = io.conn_id,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "socket write timed out; disconnecting consumer"
                );
                io.end("write timed out");
                return Ok(());
            }
        }
    }
}

async fn keepalive(shared: Arc<HubShared>, io: Arc<ConnectionIo>) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(shared.config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = io.cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let silent = lock(&io.last_inbound).elapsed();
        if silent >= shared.config.pong_timeout {
            warn!(
                conn_id = io.conn_id,
                silent_secs = silent.as_secs(),
                "consumer stopped answering pings"
            );
            io.end("keepalive timeout");
            return Ok(());
        }

        match io.outbound.try_send(Outbound::Ping) {
            Ok(()) => {}
            // A saturated write path will trip its own deadline.
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                io.end("send queue closed");
                return Ok(());
            }
        }
    }
}
