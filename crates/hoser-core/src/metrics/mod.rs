//! Metrics and observability infrastructure.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

pub use server::{MetricsController, init_global, init_test};

/// Emit an internal event.
///
/// ```ignore
/// use hoser_core::emit;
/// use hoser_core::metrics::events::BytesRelayed;
///
/// emit!(BytesRelayed { connector: "/demo/cat[stdout]".into(), bytes: 1024 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
