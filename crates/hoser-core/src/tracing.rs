//! Tracing initialization for the CLI.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize tracing on standard error.
///
/// Uses `RUST_LOG` when set. Otherwise logs at `warn`, or `debug` for the
/// `hoser` crates when `verbose` is requested. Standard output is left to the
/// pipelines being supervised.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "warn,hoser=debug,hoser_core=debug"
    } else {
        "warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(verbose)
        .with_writer(std::io::stderr);

    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init();
}
