use serde::{Deserialize, Serialize};

// =============================================================================
// File config sections (deserialized by the embedding application, e.g. figment)
// =============================================================================
//
//   config.toml:     [batch]
//                    interval_ms = 16
//
//   env var:         PANEMUX_BATCH__INTERVAL_MS=16   (double underscore = nesting)
//
// Runtime views (`BatchPolicy`, `HubConfig`, `RestartPolicy`) are built with
// their `from_file` constructors.

/// All streaming tunables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFileConfig {
    #[serde(default)]
    pub batch: BatchFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
    #[serde(default)]
    pub supervisor: SupervisorFileConfig,
}

/// Output batching (lives under `[batch]` in config.toml).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFileConfig {
    /// Base flush tick; a pane quiet for this long is flushed.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Longest tick the loop backs off to when nothing is flowing.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// Buffer size that forces an immediate flush.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Longest any byte may stay buffered under a steady writer.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    /// Lower bound applied to `max_age_ms`.
    #[serde(default = "default_max_age_floor_ms")]
    pub max_age_floor_ms: u64,
    /// Released pane buffers kept for reuse.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

impl Default for BatchFileConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            max_bytes: default_max_bytes(),
            max_age_ms: default_max_age_ms(),
            max_age_floor_ms: default_max_age_floor_ms(),
            pool_capacity: default_pool_capacity(),
        }
    }
}

/// Streaming hub (lives under `[hub]` in config.toml).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubFileConfig {
    /// Loopback port; 0 lets the OS pick.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Tear down a connection that has been silent this long.
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            port: 0,
            write_timeout_ms: default_write_timeout_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

/// Supervised loop restarts (lives under `[supervisor]` in config.toml).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorFileConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
}

impl Default for SupervisorFileConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_restarts: default_max_restarts(),
            stable_after_secs: default_stable_after_secs(),
        }
    }
}

fn default_interval_ms() -> u64 {
    16
}
fn default_idle_interval_ms() -> u64 {
    100
}
fn default_max_bytes() -> usize {
    32 * 1024
}
fn default_max_age_ms() -> u64 {
    64
}
fn default_max_age_floor_ms() -> u64 {
    50
}
fn default_pool_capacity() -> usize {
    64
}
fn default_write_timeout_ms() -> u64 {
    2000
}
fn default_ping_interval_secs() -> u64 {
    15
}
fn default_pong_timeout_secs() -> u64 {
    45
}
fn default_send_queue_capacity() -> usize {
    256
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5000
}
fn default_max_restarts() -> u32 {
    5
}
fn default_stable_after_secs() -> u64 {
    30
}
