//! hoser-core: Runtime plumbing for the hoser pipeline orchestrator.
//!
//! - `config/` - YAML runtime configuration, environment interpolation and multi-file loading
//! - `metrics/` - Prometheus metrics infrastructure and internal events
//! - `topology/` - Task results and the restarting service tree
//! - `signal` - Signal handling for graceful shutdown
//! - `tracing` - Log subscriber setup for the CLI
//! - `error` - Common error types

pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod topology;
pub mod tracing;

pub use config::{ConfigArgs, ConfigPath, HoserConfig, MetricsConfig, RestartConfig, RuntimeConfig};
pub use error::{ConfigError, MetricsError, TreeError};
pub use metrics::{MetricsController, init_global as init_metrics, init_test as init_metrics_test};
pub use signal::shutdown_signal;
pub use topology::{
    EventHook, RestartPolicy, Service, ServiceEvent, ServiceRef, ServiceToken, ServiceTree,
    TaskError, TaskOutput, TaskResult, random_jitter,
};
pub use tracing::init_tracing;
