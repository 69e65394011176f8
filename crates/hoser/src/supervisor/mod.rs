//! Process supervision and data routing.
//!
//! The `Supervisor` owns every pipeline and the working directory they live
//! in. Each pipeline runs its processes and spouts in its own service tree,
//! registered under the supervisor's root tree.

pub mod connector;
pub mod endpoint;
pub mod fifo;
pub mod pipeline;
pub mod process;
pub mod valve;
pub mod variables;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hoser_core::metrics::events::ActivePipelines;
use hoser_core::{RestartPolicy, RuntimeConfig, ServiceToken, ServiceTree, TaskError, TaskResult, emit};
use parking_lot::RwLock;
use snafu::prelude::*;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use connector::Connector;
pub use endpoint::{
    BufferSink, ByteSink, ByteSource, FileSink, FileSource, SinkRef, SourceRef, TextSource,
};
pub use pipeline::{Outlet, Pipeline};
pub use process::{ProcInfo, ProcState, Process, ProcessConfig};
pub use valve::{InValve, OutValve};
pub use variables::{Sink, Spout};

use crate::error::{
    CreatePipelineSnafu, NoSuchPipelineSnafu, PipelineExistsSnafu, RemoveWorkDirSnafu,
    StopPipelineSnafu, SupervisorError,
};

/// Timeouts and restart budget shared by every pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    pub kill_grace: Duration,
    pub stop_timeout: Duration,
    pub restart: RestartPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            restart: RestartPolicy::default(),
        }
    }
}

impl From<&RuntimeConfig> for Settings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            kill_grace: config.kill_grace(),
            stop_timeout: config.stop_timeout(),
            restart: config.restart.policy(),
        }
    }
}

pub(crate) struct SupervisorInner {
    dir: PathBuf,
    settings: Settings,
    tree: ServiceTree,
    pipelines: RwLock<HashMap<String, (Arc<Pipeline>, ServiceToken)>>,
    // Cancelled by shutdown, by `close`, or when the last pipeline is removed.
    run: CancellationToken,
}

/// Root of all pipelines. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(dir: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                dir: dir.into(),
                tree: ServiceTree::new("root", settings.restart.clone()),
                settings,
                pipelines: RwLock::new(HashMap::new()),
                run: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SupervisorInner>) -> Self {
        Self { inner }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.inner
            .pipelines
            .read()
            .get(name)
            .map(|(pipeline, _)| pipeline.clone())
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.pipelines.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a pipeline in `<dir>/pipelines/<name>` and start running it.
    pub fn add_pipeline(&self, name: &str) -> Result<Arc<Pipeline>, SupervisorError> {
        let mut pipelines = self.inner.pipelines.write();
        ensure!(!pipelines.contains_key(name), PipelineExistsSnafu { name });

        let dir = self.inner.dir.join("pipelines").join(name);
        let pipeline = Pipeline::new(
            name,
            dir,
            self.inner.settings.clone(),
            Arc::downgrade(&self.inner),
        )
        .context(CreatePipelineSnafu)?;
        let pipeline = Arc::new(pipeline);
        let token = self.inner.tree.add(pipeline.clone());
        pipelines.insert(name.to_string(), (pipeline.clone(), token));

        info!(pipeline = name, "Pipeline added");
        emit!(ActivePipelines {
            count: pipelines.len(),
        });
        Ok(pipeline)
    }

    /// Stop a pipeline and forget it. Removing the last pipeline ends the run.
    pub async fn remove_pipeline(&self, name: &str) -> Result<(), SupervisorError> {
        let token = self
            .inner
            .pipelines
            .read()
            .get(name)
            .map(|(_, token)| *token)
            .context(NoSuchPipelineSnafu { name })?;

        debug!(pipeline = name, "Stopping pipeline");
        if let Err(source) = self
            .inner
            .tree
            .remove_and_wait(token, self.inner.settings.stop_timeout)
            .await
        {
            warn!(pipeline = name, error = %source, "Stopping pipeline failed");
            return Err(source).context(StopPipelineSnafu { name });
        }

        let remaining = {
            let mut pipelines = self.inner.pipelines.write();
            pipelines.remove(name);
            pipelines.len()
        };
        info!(pipeline = name, remaining, "Pipeline removed");
        emit!(ActivePipelines { count: remaining });
        if remaining == 0 {
            self.inner.run.cancel();
        }
        Ok(())
    }

    /// Run every pipeline until `shutdown` fires or the last pipeline is
    /// removed. The result is `TaskError::Cancelled` when stopped on purpose.
    pub async fn serve(&self, shutdown: CancellationToken) -> TaskResult {
        let run = self.inner.run.clone();
        let tree = self.inner.tree.run(run.clone());
        tokio::pin!(tree);

        tokio::select! {
            result = &mut tree => result,
            _ = shutdown.cancelled() => {
                debug!("Supervisor shutting down");
                run.cancel();
                tree.await
            }
        }
    }

    /// `serve` on a background task.
    pub fn serve_background(&self, shutdown: CancellationToken) -> oneshot::Receiver<TaskResult> {
        let (tx, rx) = oneshot::channel();
        let supervisor = self.clone();
        tokio::spawn(async move {
            let result = supervisor.serve(shutdown).await;
            let _ = tx.send(result);
        });
        rx
    }

    /// Stop everything and delete the working directory.
    pub fn close(&self) -> Result<(), SupervisorError> {
        self.inner.run.cancel();
        match std::fs::remove_dir_all(&self.inner.dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).context(RemoveWorkDirSnafu {
                    path: &self.inner.dir,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Whether a terminal result means the supervisor was stopped on purpose.
pub fn stopped_cleanly(result: &TaskResult) -> bool {
    matches!(result, Ok(_) | Err(TaskError::Cancelled))
}
