//! Streaming counters for observability.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Hub-wide counters. Cheap to bump from any task.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    // Connections
    /// Consumers that attached since start
    pub connections_total: AtomicU64,
    /// Attachments that evicted an existing consumer
    pub connections_replaced: AtomicU64,

    // Output
    /// Binary frames written to the socket
    pub frames_sent: AtomicU64,
    /// Pane data bytes written (excluding headers)
    pub bytes_sent: AtomicU64,
    /// Frames refused because the send queue was full
    pub frames_dropped: AtomicU64,

    // Errors
    pub write_timeouts: AtomicU64,
    pub control_errors: AtomicU64,

    start_time: Option<Instant>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self, replaced: bool) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.connections_replaced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn frame_sent(&self, data_len: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(data_len as u64, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_timeout(&self) {
        self.write_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn control_error(&self) {
        self.control_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                total: self.connections_total.load(Ordering::Relaxed),
                replaced: self.connections_replaced.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                sent: self.frames_sent.load(Ordering::Relaxed),
                bytes: self.bytes_sent.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                write_timeouts: self.write_timeouts.load(Ordering::Relaxed),
                control: self.control_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub frames: FrameMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub total: u64,
    pub replaced: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub sent: u64,
    pub bytes: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub write_timeouts: u64,
    pub control: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_tracking() {
        let metrics = StreamMetrics::new();
        metrics.connection_opened(false);
        metrics.connection_opened(true);

        let snap = metrics.snapshot();
        assert_eq!(snap.connections.total, 2);
        assert_eq!(snap.connections.replaced, 1);
    }

    #[test]
    fn frame_and_error_tracking() {
        let metrics = StreamMetrics::new();
        metrics.frame_sent(10);
        metrics.frame_sent(5);
        metrics.frame_dropped();
        metrics.write_timeout();
        metrics.control_error();
        metrics.control_error();

        let snap = metrics.snapshot();
        assert_eq!(
            snap.frames,
            FrameMetrics {
                sent: 2,
                bytes: 15,
                dropped: 1
            }
        );
        assert_eq!(snap.errors.write_timeouts, 1);
        assert_eq!(snap.errors.control, 2);
    }

    #[test]
    fn snapshot_serializes() {
        let json = serde_json::to_value(StreamMetrics::new().snapshot()).unwrap();
        assert_eq!(json["frames"]["dropped"], 0);
        assert!(json["uptime_secs"].is_u64());
    }
}
