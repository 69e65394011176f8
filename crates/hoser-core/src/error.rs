//! Error types shared across hoser crates.

use std::path::PathBuf;
use std::time::Duration;

use snafu::prelude::*;

// ============ Config Errors ============

/// Errors that can occur while loading runtime configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },

    /// Failed to list a configuration directory.
    #[snafu(display("Failed to read configuration directory {}: {source}", path.display()))]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not YAML.
    #[snafu(display("Unsupported configuration format: {} (expected .yaml or .yml)", path.display()))]
    UnsupportedFormat { path: PathBuf },

    /// A top-level document was not a mapping.
    #[snafu(display("Configuration document must be a mapping"))]
    NotAMapping,

    /// A configured value is out of range.
    #[snafu(display("Invalid value for {field}: {message}"))]
    InvalidValue { field: String, message: String },

    /// Several files failed to load.
    #[snafu(display("Configuration errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// The metrics controller was already installed.
    #[snafu(display("Metrics are already initialized"))]
    AlreadyInitialized,

    /// The metrics controller has not been installed yet.
    #[snafu(display("Metrics are not initialized"))]
    NotInitialized,

    /// The listen address could not be parsed.
    #[snafu(display("Invalid metrics address '{address}': {source}"))]
    InvalidAddress {
        address: String,
        source: std::net::AddrParseError,
    },
}

// ============ Service Tree Errors ============

/// Errors returned when managing children of a service tree.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TreeError {
    /// The token does not name a child of this tree.
    #[snafu(display("service tree '{tree}' has no child for token {token}"))]
    UnknownService { tree: String, token: u64 },

    /// The child did not stop within the allotted time.
    #[snafu(display("service '{service}' did not stop within {timeout:?}"))]
    StopTimeout { service: String, timeout: Duration },
}
