//! Daemon settings, loaded from an optional YAML file.
//!
//! Every field has a default, so an empty file (or no file) is valid.
//! `SWCONF_RUN_DIR` in the environment overrides `run_dir`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::instance::WorkerTiming;


pub const RUN_DIR_ENV: &str = "SWCONF_RUN_DIR";


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSettings {
    /// Root of the per-process directories (`<run_dir>/<pid>/config.sock`).
    pub run_dir: PathBuf,

    /// Optional leader name, published as `<run_dir>/by-name/<name>`.
    pub name: Option<String>,

    /// How long each daemon tick waits for a new connection.
    pub socket_poll_ms: u64,

    /// A request line left incomplete for this long closes its session.
    pub request_timeout_ms: u64,

    /// Time allowed for live workers to match the configured set.
    pub convergence_window_ms: u64,

    /// Time workers get to exit on shutdown before they are detached.
    pub shutdown_grace_ms: u64,

    pub breath_interval_ms: u64,
    pub publish_interval_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        DaemonSettings {
            run_dir: PathBuf::from("/var/run/swconf"),
            name: None,
            socket_poll_ms: 50,
            request_timeout_ms: 5_000,
            convergence_window_ms: 2_000,
            shutdown_grace_ms: 2_000,
            breath_interval_ms: 10,
            publish_interval_ms: 100,
        }
    }
}

impl DaemonSettings {
    pub fn load(path: &Path) -> Result<DaemonSettings> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("cannot read '{}': {}", path.display(), e)))?;
        DaemonSettings::parse(&content)
    }

    pub fn parse(content: &str) -> Result<DaemonSettings> {
        if content.trim().is_empty() {
            return Ok(DaemonSettings::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::invalid("load", "settings", format!("invalid settings: {}", e)))
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> DaemonSettings {
        if let Some(dir) = lookup(RUN_DIR_ENV).filter(|d| !d.is_empty()) {
            self.run_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn from_process_env(self) -> DaemonSettings {
        self.with_env(|k| std::env::var(k).ok())
    }

    pub fn timing(&self) -> WorkerTiming {
        WorkerTiming {
            breath_interval: Duration::from_millis(self.breath_interval_ms),
            publish_interval: Duration::from_millis(self.publish_interval_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn convergence_window(&self) -> Duration {
        Duration::from_millis(self.convergence_window_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
