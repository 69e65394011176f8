//! Supervision tree.
//!
//! A `ServiceTree` runs a set of `Service`s, each in its own task with its own
//! child cancellation token. A service that fails is restarted after a backoff
//! with random jitter, until it fails more than `max_restarts` times within
//! `window`. A service that returns `Ok`, or that returns because its token was
//! cancelled, is never restarted.
//!
//! Every termination is reported to the tree's event hook, which lets owners
//! react to services that have been given up on.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use snafu::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{TaskError, TaskResult, random_jitter};
use crate::emit;
use crate::error::{StopTimeoutSnafu, TreeError, UnknownServiceSnafu};
use crate::metrics::events::ServiceRestarted;

/// Something a `ServiceTree` can run and restart.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Name used in logs and events.
    fn name(&self) -> String;

    /// Run until finished, failed, or `shutdown` is cancelled.
    ///
    /// May be called again after returning an error.
    async fn serve(&self, shutdown: CancellationToken) -> TaskResult;

    /// Access to the concrete type, for event hooks.
    fn as_any(&self) -> &dyn Any;
}

pub type ServiceRef = Arc<dyn Service>;

/// Handle to a service added to a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceToken(u64);

impl fmt::Display for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Restart budget for failed services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
    pub backoff: Duration,
    pub jitter: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(30),
            backoff: Duration::from_secs(1),
            jitter: Duration::from_millis(250),
        }
    }
}

/// A service returned from `serve`.
#[derive(Clone)]
pub struct ServiceEvent {
    pub tree: String,
    pub service: ServiceRef,
    /// Whether the tree is going to run the service again.
    pub restarting: bool,
    /// Set when the service failed; `None` for clean exits and cancellation.
    pub error: Option<Arc<TaskError>>,
}

impl fmt::Debug for ServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEvent")
            .field("tree", &self.tree)
            .field("service", &self.service.name())
            .field("restarting", &self.restarting)
            .field("error", &self.error)
            .finish()
    }
}

pub type EventHook = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

pub struct ServiceTree {
    name: String,
    policy: RestartPolicy,
    hook: Option<EventHook>,
    next_token: AtomicU64,
    state: Mutex<TreeState>,
}

#[derive(Default)]
struct TreeState {
    running: Option<CancellationToken>,
    pending: Vec<(ServiceToken, ServiceRef)>,
    children: HashMap<ServiceToken, Child>,
}

struct Child {
    name: String,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl ServiceTree {
    pub fn new(name: impl Into<String>, policy: RestartPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            hook: None,
            next_token: AtomicU64::new(0),
            state: Mutex::new(TreeState::default()),
        }
    }

    pub fn with_hook(mut self, hook: EventHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a service. It starts immediately if the tree is running, otherwise
    /// when `run` is called. Services that already returned are forgotten.
    pub fn add(&self, service: ServiceRef) -> ServiceToken {
        let token = ServiceToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock();
        state.children.retain(|_, child| !child.handle.is_finished());
        match state.running.clone() {
            Some(run) => {
                let child = self.spawn_child(service, &run);
                state.children.insert(token, child);
            }
            None => state.pending.push((token, service)),
        }
        token
    }

    /// Stop a service and wait up to `timeout` for it to return. A service
    /// that already returned and was pruned is reported as unknown.
    pub async fn remove_and_wait(
        &self,
        token: ServiceToken,
        timeout: Duration,
    ) -> Result<(), TreeError> {
        let child = {
            let mut state = self.state.lock();
            if let Some(pos) = state.pending.iter().position(|(t, _)| *t == token) {
                state.pending.remove(pos);
                return Ok(());
            }
            state.children.remove(&token)
        };
        let child = child.context(UnknownServiceSnafu {
            tree: self.name.clone(),
            token: token.0,
        })?;

        child.shutdown.cancel();
        match tokio::time::timeout(timeout, child.handle).await {
            Ok(_) => Ok(()),
            Err(_) => StopTimeoutSnafu {
                service: child.name,
                timeout,
            }
            .fail(),
        }
    }

    /// Run every service until `shutdown` is cancelled, then stop them all.
    ///
    /// Always returns `TaskError::Cancelled`.
    pub async fn run(&self, shutdown: CancellationToken) -> TaskResult {
        {
            let mut state = self.state.lock();
            state.running = Some(shutdown.clone());
            for (token, service) in std::mem::take(&mut state.pending) {
                let child = self.spawn_child(service, &shutdown);
                state.children.insert(token, child);
            }
        }
        debug!(tree = %self.name, "Service tree started");

        shutdown.cancelled().await;

        let children: Vec<Child> = {
            let mut state = self.state.lock();
            state.running = None;
            state.children.drain().map(|(_, child)| child).collect()
        };
        for child in children {
            child.shutdown.cancel();
            if let Err(e) = child.handle.await {
                warn!(tree = %self.name, service = %child.name, error = %e, "Service task aborted");
            }
        }
        debug!(tree = %self.name, "Service tree stopped");
        Err(TaskError::Cancelled)
    }

    fn spawn_child(&self, service: ServiceRef, run: &CancellationToken) -> Child {
        let shutdown = run.child_token();
        let name = service.name();
        let supervisor = Supervision {
            tree: self.name.clone(),
            policy: self.policy.clone(),
            hook: self.hook.clone(),
        };
        let handle = tokio::spawn(supervisor.supervise(service, shutdown.clone()));
        Child {
            name,
            shutdown,
            handle,
        }
    }
}

#[async_trait]
impl Service for ServiceTree {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn serve(&self, shutdown: CancellationToken) -> TaskResult {
        self.run(shutdown).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Supervision {
    tree: String,
    policy: RestartPolicy,
    hook: Option<EventHook>,
}

impl Supervision {
    async fn supervise(self, service: ServiceRef, shutdown: CancellationToken) {
        let name = service.name();
        let mut failures: VecDeque<Instant> = VecDeque::new();

        loop {
            debug!(tree = %self.tree, service = %name, "Starting service");
            let result = AssertUnwindSafe(service.serve(shutdown.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(TaskError::panicked(payload)));

            let err = match result {
                Ok(output) => {
                    info!(
                        tree = %self.tree,
                        service = %name,
                        message = output.message.as_deref().unwrap_or("done"),
                        "Service finished"
                    );
                    self.notify(&service, false, None);
                    return;
                }
                Err(err) if shutdown.is_cancelled() || err.is_cancelled() => {
                    debug!(tree = %self.tree, service = %name, reason = %err, "Service stopped");
                    self.notify(&service, false, None);
                    return;
                }
                Err(err) => err,
            };

            let now = Instant::now();
            failures.push_back(now);
            while failures
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.policy.window)
            {
                failures.pop_front();
            }
            let restarting = failures.len() <= self.policy.max_restarts as usize;

            if restarting {
                warn!(
                    tree = %self.tree,
                    service = %name,
                    error = %err,
                    failures = failures.len(),
                    "Service failed, restarting"
                );
            } else {
                error!(
                    tree = %self.tree,
                    service = %name,
                    error = %err,
                    failures = failures.len(),
                    "Service failed too often, giving up"
                );
            }
            self.notify(&service, restarting, Some(Arc::new(err)));
            if !restarting {
                return;
            }

            emit!(ServiceRestarted {
                tree: self.tree.clone(),
                service: name.clone(),
            });
            let delay = self.policy.backoff + random_jitter(self.policy.jitter);
            if shutdown
                .run_until_cancelled(tokio::time::sleep(delay))
                .await
                .is_none()
            {
                return;
            }
        }
    }

    fn notify(&self, service: &ServiceRef, restarting: bool, error: Option<Arc<TaskError>>) {
        if let Some(hook) = &self.hook {
            hook(&ServiceEvent {
                tree: self.tree.clone(),
                service: service.clone(),
                restarting,
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TaskOutput;
    use std::sync::atomic::AtomicUsize;

    struct Counted<F> {
        name: &'static str,
        runs: Arc<AtomicUsize>,
        behaviour: F,
    }

    #[async_trait]
    impl<F> Service for Counted<F>
    where
        F: Fn(usize) -> TaskResult + Send + Sync + 'static,
    {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn serve(&self, _shutdown: CancellationToken) -> TaskResult {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            (self.behaviour)(run)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn counted<F>(name: &'static str, runs: &Arc<AtomicUsize>, behaviour: F) -> Arc<Counted<F>>
    where
        F: Fn(usize) -> TaskResult + Send + Sync + 'static,
    {
        Arc::new(Counted {
            name,
            runs: runs.clone(),
            behaviour,
        })
    }

    struct UntilCancelled {
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for UntilCancelled {
        fn name(&self) -> String {
            "until-cancelled".to_string()
        }

        async fn serve(&self, shutdown: CancellationToken) -> TaskResult {
            shutdown.cancelled().await;
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::Cancelled)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn fast_policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(1),
            jitter: Duration::ZERO,
        }
    }

    fn recording_hook() -> (EventHook, Arc<Mutex<Vec<(String, bool, bool)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let hook: EventHook = Arc::new(move |event: &ServiceEvent| {
            sink.lock()
                .push((event.service.name(), event.restarting, event.error.is_some()));
        });
        (hook, events)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn spawn_tree(tree: Arc<ServiceTree>, shutdown: &CancellationToken) -> JoinHandle<TaskResult> {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { tree.run(shutdown).await })
    }

    #[tokio::test]
    async fn test_successful_service_is_not_restarted() {
        let (hook, events) = recording_hook();
        let tree = Arc::new(ServiceTree::new("root", fast_policy(5)).with_hook(hook));
        let runs = Arc::new(AtomicUsize::new(0));
        tree.add(counted("once", &runs, |_| Ok(TaskOutput::empty())));

        let shutdown = CancellationToken::new();
        let handle = spawn_tree(tree, &shutdown);
        eventually(|| !events.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(events.lock()[0], ("once".to_string(), false, false));

        shutdown.cancel();
        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_finished_services_are_pruned_on_add() {
        let (hook, events) = recording_hook();
        let tree = Arc::new(ServiceTree::new("root", fast_policy(5)).with_hook(hook));
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let handle = spawn_tree(tree.clone(), &shutdown);

        let first = tree.add(counted("once", &runs, |_| Ok(TaskOutput::empty())));
        eventually(|| !events.lock().is_empty()).await;
        eventually(|| tree.state.lock().children.values().all(|c| c.handle.is_finished())).await;

        let stopped = Arc::new(AtomicUsize::new(0));
        tree.add(Arc::new(UntilCancelled {
            stopped: stopped.clone(),
        }));
        assert_eq!(tree.state.lock().children.len(), 1);
        let err = tree
            .remove_and_wait(first, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::UnknownService { .. }));

        shutdown.cancel();
        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_service_restarts_until_budget_spent() {
        let (hook, events) = recording_hook();
        let tree = Arc::new(ServiceTree::new("root", fast_policy(2)).with_hook(hook));
        let runs = Arc::new(AtomicUsize::new(0));
        tree.add(counted("flaky", &runs, |_| {
            Err(TaskError::failed(std::io::Error::other("boom")))
        }));

        let shutdown = CancellationToken::new();
        let handle = spawn_tree(tree, &shutdown);
        eventually(|| events.lock().iter().any(|(_, restarting, _)| !restarting)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let recorded = events.lock().clone();
        assert_eq!(
            recorded,
            vec![
                ("flaky".to_string(), true, true),
                ("flaky".to_string(), true, true),
                ("flaky".to_string(), false, true),
            ]
        );

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_service_recovers_after_restart() {
        let tree = Arc::new(ServiceTree::new("root", fast_policy(5)));
        let runs = Arc::new(AtomicUsize::new(0));
        tree.add(counted("second-time-lucky", &runs, |run| {
            if run < 2 {
                Err(TaskError::failed(std::io::Error::other("first run fails")))
            } else {
                Ok(TaskOutput::with_message("ok"))
            }
        }));

        let shutdown = CancellationToken::new();
        let handle = spawn_tree(tree, &shutdown);
        eventually(|| runs.load(Ordering::SeqCst) >= 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let (hook, events) = recording_hook();
        let tree = Arc::new(ServiceTree::new("root", fast_policy(0)).with_hook(hook));
        let runs = Arc::new(AtomicUsize::new(0));
        tree.add(counted("panicky", &runs, |_| -> TaskResult { panic!("kaboom") }));

        let shutdown = CancellationToken::new();
        let handle = spawn_tree(tree, &shutdown);
        eventually(|| !events.lock().is_empty()).await;
        assert_eq!(events.lock()[0], ("panicky".to_string(), false, true));

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_cancelling_tree_stops_children() {
        let (hook, events) = recording_hook();
        let tree = Arc::new(ServiceTree::new("root", fast_policy(5)).with_hook(hook));
        let stopped = Arc::new(AtomicUsize::new(0));
        tree.add(Arc::new(UntilCancelled {
            stopped: stopped.clone(),
        }));

        let shutdown = CancellationToken::new();
        let handle = spawn_tree(tree.clone(), &shutdown);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Added while running: starts right away.
        tree.add(Arc::new(UntilCancelled {
            stopped: stopped.clone(),
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
        assert!(events.lock().iter().all(|(_, restarting, failed)| !restarting && !failed));
    }

    #[tokio::test]
    async fn test_remove_and_wait() {
        let tree = Arc::new(ServiceTree::new("root", fast_policy(5)));
        let stopped = Arc::new(AtomicUsize::new(0));
        let pending = tree.add(Arc::new(UntilCancelled {
            stopped: stopped.clone(),
        }));
        // Never started, removed straight from the pending list.
        tree.remove_and_wait(pending, Duration::from_secs(1)).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_tree(tree.clone(), &shutdown);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let running = tree.add(Arc::new(UntilCancelled {
            stopped: stopped.clone(),
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tree.remove_and_wait(running, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        let err = tree
            .remove_and_wait(running, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::UnknownService { .. }));

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_remove_reports_stuck_service() {
        struct Stubborn;

        #[async_trait]
        impl Service for Stubborn {
            fn name(&self) -> String {
                "stubborn".to_string()
            }

            async fn serve(&self, _shutdown: CancellationToken) -> TaskResult {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(TaskOutput::empty())
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let tree = Arc::new(ServiceTree::new("root", fast_policy(5)));
        let token = tree.add(Arc::new(Stubborn));
        let shutdown = CancellationToken::new();
        let _handle = spawn_tree(tree.clone(), &shutdown);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = tree
            .remove_and_wait(token, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::StopTimeout { ref service, .. } if service == "stubborn"));
    }

    #[tokio::test]
    async fn test_nested_tree_stops_with_parent() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(ServiceTree::new("inner", fast_policy(5)));
        inner.add(Arc::new(UntilCancelled {
            stopped: stopped.clone(),
        }));

        let outer = Arc::new(ServiceTree::new("outer", fast_policy(5)));
        outer.add(inner);

        let shutdown = CancellationToken::new();
        let handle = spawn_tree(outer, &shutdown);
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        let _ = handle.await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
