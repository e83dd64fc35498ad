//! Bounded per-pane output history.
//!
//! Output that could not be streamed (no consumer, or the pane was not
//! subscribed) is kept here so a consumer that subscribes later can be sent
//! the recent tail instead of a blank pane.

use std::collections::{HashMap, HashSet, VecDeque};

/// Default per-pane history size.
pub const DEFAULT_MAX_BYTES_PER_PANE: usize = 64 * 1024;

/// Per-pane byte history trimmed from the front.
#[derive(Debug)]
pub struct ReplayBuffer {
    panes: HashMap<String, VecDeque<u8>>,
    max_bytes_per_pane: usize,
}

impl ReplayBuffer {
    pub fn new(max_bytes_per_pane: usize) -> Self {
        Self {
            panes: HashMap::new(),
            max_bytes_per_pane,
        }
    }

    /// Append output for a pane, evicting its oldest bytes past the limit.
    pub fn push(&mut self, pane_id: &str, data: &[u8]) {
        if data.is_empty() || self.max_bytes_per_pane == 0 {
            return;
        }
        let history = self.panes.entry(pane_id.to_string()).or_default();

        // Only the tail of an oversized chunk can survive.
        let data = if data.len() > self.max_bytes_per_pane {
            history.clear();
            &data[data.len() - self.max_bytes_per_pane..]
        } else {
            data
        };

        let overflow = (history.len() + data.len()).saturating_sub(self.max_bytes_per_pane);
        history.drain(..overflow);
        history.extend(data);
    }

    /// The retained history for a pane, oldest byte first.
    pub fn history(&self, pane_id: &str) -> Option<Vec<u8>> {
        self.panes
            .get(pane_id)
            .filter(|h| !h.is_empty())
            .map(|h| h.iter().copied().collect())
    }

    pub fn forget(&mut self, pane_id: &str) {
        self.panes.remove(pane_id);
    }

    /// Drop history for every pane not in `live`.
    pub fn retain(&mut self, live: &HashSet<String>) {
        self.panes.retain(|id, _| live.contains(id));
    }

    /// Bytes retained for one pane.
    pub fn len(&self, pane_id: &str) -> usize {
        self.panes.get(pane_id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn pane_count(&self) -> usize {
        self.panes.len()
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES_PER_PANE)
    }
}
