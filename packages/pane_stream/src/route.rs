//! Routing of flushed output between the hub and a fallback sink.

use std::sync::Arc;

use crate::batcher::PaneSink;
use crate::hub::StreamHub;

/// Sends a flush to the hub when the live consumer wants that pane, and to
/// `fallback` otherwise, so output is never lost while the stream is down.
pub struct HubRoute {
    hub: Arc<StreamHub>,
    fallback: Arc<dyn PaneSink>,
}

impl HubRoute {
    pub fn new(hub: Arc<StreamHub>, fallback: Arc<dyn PaneSink>) -> Self {
        Self { hub, fallback }
    }
}

impl PaneSink for HubRoute {
    fn deliver(&self, pane_id: &str, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if self.hub.has_active_connection() && self.hub.is_subscribed(pane_id) {
            self.hub.broadcast_pane_data(pane_id, &data);
        } else {
            self.fallback.deliver(pane_id, data);
        }
    }
}
