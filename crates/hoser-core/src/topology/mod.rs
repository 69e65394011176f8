//! Orchestration primitives.
//!
//! - `task`: results shared by everything that runs under supervision
//! - `tree`: a supervision tree that restarts failed services with backoff

mod task;
mod tree;

use std::time::Duration;

use rand::Rng;

pub use task::{TaskError, TaskOutput, TaskResult};
pub use tree::{
    EventHook, RestartPolicy, Service, ServiceEvent, ServiceRef, ServiceToken, ServiceTree,
};

/// Random delay in `[0, max)`, used to spread out restarts.
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_ms))
    } else {
        Duration::ZERO
    }
}
