//! Runtime configuration.
//!
//! The script describes what to run; these settings describe how the runtime
//! behaves while running it. All fields have defaults, so an empty (or
//! missing) configuration is valid.
//!
//! ```yaml
//! runtime:
//!   work_dir: /var/tmp/hoser
//!   startup_timeout_ms: 25000
//!   stop_timeout_ms: 10000
//!   kill_grace_ms: 5000
//!   restart:
//!     max_restarts: 5
//!     window_ms: 30000
//!     backoff_ms: 1000
//!     jitter_ms: 250
//! metrics:
//!   address: 127.0.0.1:9464
//! ```

mod loader;
mod path;
mod vars;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::topology::RestartPolicy;

pub use loader::{load_from_paths, merge_values};
pub use path::{ConfigArgs, ConfigPath, is_yaml_file};
pub use vars::{Interpolated, interpolate, interpolate_with};

/// Root of a hoser configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HoserConfig {
    pub runtime: RuntimeConfig,
    pub metrics: MetricsConfig,
}

/// Timeouts and the working directory used by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Directory holding per-pipeline and per-process state, removed on exit.
    /// Defaults to `$TMPDIR/hoser.<pid>`.
    pub work_dir: Option<PathBuf>,
    /// How long `start` waits for a process to come up.
    pub startup_timeout_ms: u64,
    /// How long stopping a pipeline may take before it is reported as stuck.
    pub stop_timeout_ms: u64,
    /// Grace period between SIGHUP and SIGKILL when stopping a process.
    pub kill_grace_ms: u64,
    pub restart: RestartConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            startup_timeout_ms: 25_000,
            stop_timeout_ms: 10_000,
            kill_grace_ms: 5_000,
            restart: RestartConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// The configured work directory, or a per-process temporary one.
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("hoser.{}", std::process::id()))
        })
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// How failed services are restarted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartConfig {
    /// Failures tolerated inside `window_ms` before a service is given up on.
    pub max_restarts: u32,
    pub window_ms: u64,
    pub backoff_ms: u64,
    /// Upper bound of the random delay added to each backoff.
    pub jitter_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window_ms: 30_000,
            backoff_ms: 1_000,
            jitter_ms: 250,
        }
    }
}

impl RestartConfig {
    pub fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            window: Duration::from_millis(self.window_ms),
            backoff: Duration::from_millis(self.backoff_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

/// Prometheus exporter settings. Metrics are served only when an address is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub address: Option<String>,
}

impl HoserConfig {
    /// Parse a single YAML document, interpolating environment variables first.
    pub fn from_yaml(contents: &str) -> Result<Self, crate::error::ConfigError> {
        let value = loader::parse_document(contents)?;
        loader::from_value(value)
    }
}
