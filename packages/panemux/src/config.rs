use pane_pty::{BackendPreference, TerminalConfig, default_shell};
use pane_stream::config::{BatchFileConfig, HubFileConfig, SupervisorFileConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Daemon config (figment-deserialized from defaults / panemux.toml / env vars)
// =============================================================================
//
//   panemux.toml:    [panes]
//                    count = 4
//
//   env var:         PANEMUX_PANES__COUNT=4   (double underscore = nesting)
//
// The `[batch]`, `[hub]` and `[supervisor]` sections are pane_stream's.

pub const DEFAULT_CONFIG_FILE: &str = "panemux.toml";

/// Which terminal backend panes should use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Native PTY, falling back to pipes
    #[default]
    Auto,
    /// Native PTY only
    Native,
    /// stdin/stdout/stderr pipes
    Pipes,
}

impl From<BackendChoice> for BackendPreference {
    fn from(choice: BackendChoice) -> Self {
        match choice {
            BackendChoice::Auto => BackendPreference::Auto,
            BackendChoice::Native => BackendPreference::Native,
            BackendChoice::Pipes => BackendPreference::Pipes,
        }
    }
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub panes: PanesFileConfig,
    #[serde(default)]
    pub batch: BatchFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
    #[serde(default)]
    pub supervisor: SupervisorFileConfig,
}

/// Pane processes (lives under `[panes]` in panemux.toml).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanesFileConfig {
    #[serde(default = "default_count")]
    pub count: usize,
    /// Program to run in each pane; the user's shell when unset.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub backend: BackendChoice,
    /// Per-pane output kept for consumers that subscribe late.
    #[serde(default = "default_replay_kb")]
    pub replay_kb: usize,
}

impl Default for PanesFileConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            command: None,
            args: Vec::new(),
            working_dir: None,
            cols: default_cols(),
            rows: default_rows(),
            backend: BackendChoice::default(),
            replay_kb: default_replay_kb(),
        }
    }
}

impl PanesFileConfig {
    pub fn terminal_config(&self) -> TerminalConfig {
        TerminalConfig {
            command: self.command.clone().unwrap_or_else(default_shell),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            cols: self.cols,
            rows: self.rows,
            backend: self.backend.into(),
            ..Default::default()
        }
    }

    pub fn replay_bytes(&self) -> usize {
        self.replay_kb.saturating_mul(1024)
    }
}

fn default_count() -> usize {
    1
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_replay_kb() -> usize {
    64
}

/// Build a figment that layers: defaults → config file → PANEMUX_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PANEMUX_HUB__PORT=7681`  →  `hub.port = 7681`
///   `PANEMUX_BATCH__INTERVAL_MS=8`  →  `batch.interval_ms = 8`
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("PANEMUX_").split("__"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_file_or_env() {
        Jail::expect_with(|_jail| {
            let fc: FileConfig = load_config(Path::new(DEFAULT_CONFIG_FILE)).extract()?;
            assert_eq!(fc, FileConfig::default());
            assert_eq!(fc.panes.count, 1);
            assert_eq!(fc.panes.replay_bytes(), 64 * 1024);
            assert_eq!(fc.batch.interval_ms, 16);
            assert_eq!(fc.hub.port, 0);
            Ok(())
        });
    }

    #[test]
    fn file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [panes]
                count = 3
                command = "/bin/bash"
                args = ["-l"]
                backend = "pipes"

                [batch]
                interval_ms = 8
                max_bytes = 4096

                [hub]
                port = 7000
                "#,
            )?;
            jail.set_env("PANEMUX_HUB__PORT", "7681");
            jail.set_env("PANEMUX_SUPERVISOR__MAX_RESTARTS", "9");

            let fc: FileConfig = load_config(Path::new(DEFAULT_CONFIG_FILE)).extract()?;
            assert_eq!(fc.panes.count, 3);
            assert_eq!(fc.panes.backend, BackendChoice::Pipes);
            assert_eq!(fc.batch.interval_ms, 8);
            assert_eq!(fc.batch.max_bytes, 4096);
            // Unset keys in a present section keep their defaults.
            assert_eq!(fc.batch.max_age_ms, 64);
            assert_eq!(fc.hub.port, 7681);
            assert_eq!(fc.supervisor.max_restarts, 9);

            let terminal = fc.panes.terminal_config();
            assert_eq!(terminal.command, "/bin/bash");
            assert_eq!(terminal.args, vec!["-l".to_string()]);
            assert_eq!(terminal.backend, BackendPreference::Pipes);
            Ok(())
        });
    }

    #[test]
    fn explicit_path_outside_cwd() {
        Jail::expect_with(|_jail| {
            let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
            let path = dir.path().join("custom.toml");
            std::fs::write(&path, "[panes]\ncols = 132\nrows = 50\nreplay_kb = 0\n")
                .map_err(|e| e.to_string())?;

            let fc: FileConfig = load_config(&path).extract()?;
            assert_eq!((fc.panes.cols, fc.panes.rows), (132, 50));
            assert_eq!(fc.panes.replay_bytes(), 0);
            Ok(())
        });
    }

    #[test]
    fn invalid_backend_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, "[panes]\nbackend = \"serial\"\n")?;
            let result: Result<FileConfig, _> = load_config(Path::new(DEFAULT_CONFIG_FILE)).extract();
            assert!(result.is_err());
            Ok(())
        });
    }
}
