//! Internal events for metrics emission.
//!
//! Each struct is a measurable occurrence in a running pipeline. Labels carry
//! the pipeline-qualified names so several pipelines can share one exporter.

use metrics::{counter, gauge};
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    fn emit(self);
}

/// Bytes moved by a connector from its source to its destination.
pub struct BytesRelayed {
    pub connector: String,
    pub bytes: u64,
}

impl InternalEvent for BytesRelayed {
    fn emit(self) {
        trace!(bytes = self.bytes, connector = %self.connector, "Bytes relayed");
        counter!("hoser_bytes_relayed_total", "connector" => self.connector).increment(self.bytes);
    }
}

/// A child process was spawned.
pub struct ProcessStarted {
    pub process: String,
}

impl InternalEvent for ProcessStarted {
    fn emit(self) {
        trace!(process = %self.process, "Process started");
        counter!("hoser_process_starts_total", "process" => self.process).increment(1);
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Failure,
    Signaled,
}

impl ExitKind {
    fn as_str(&self) -> &'static str {
        match self {
            ExitKind::Success => "success",
            ExitKind::Failure => "failure",
            ExitKind::Signaled => "signaled",
        }
    }
}

/// A child process exited.
pub struct ProcessExited {
    pub process: String,
    pub kind: ExitKind,
}

impl InternalEvent for ProcessExited {
    fn emit(self) {
        trace!(process = %self.process, kind = self.kind.as_str(), "Process exited");
        counter!(
            "hoser_process_exits_total",
            "process" => self.process,
            "kind" => self.kind.as_str()
        )
        .increment(1);
    }
}

/// A service tree is about to restart a failed service.
pub struct ServiceRestarted {
    pub tree: String,
    pub service: String,
}

impl InternalEvent for ServiceRestarted {
    fn emit(self) {
        trace!(tree = %self.tree, service = %self.service, "Service restarted");
        counter!(
            "hoser_service_restarts_total",
            "tree" => self.tree,
            "service" => self.service
        )
        .increment(1);
    }
}

/// Number of pipelines registered with the supervisor.
pub struct ActivePipelines {
    pub count: usize,
}

impl InternalEvent for ActivePipelines {
    fn emit(self) {
        trace!(count = self.count, "Active pipelines");
        gauge!("hoser_active_pipelines").set(self.count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricsController, init_test};

    #[test]
    fn test_events_are_rendered() {
        init_test();

        BytesRelayed {
            connector: "/demo/cat[stdout]".to_string(),
            bytes: 9,
        }
        .emit();
        ProcessExited {
            process: "/demo/cat".to_string(),
            kind: ExitKind::Signaled,
        }
        .emit();
        ActivePipelines { count: 2 }.emit();

        let output = MetricsController::get().unwrap().render();
        assert!(output.contains("hoser_bytes_relayed_total"));
        assert!(output.contains("kind=\"signaled\""));
        assert!(output.contains("hoser_active_pipelines"));
    }
}
