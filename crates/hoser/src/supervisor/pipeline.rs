//! A named group of processes and variables sharing one service tree.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use hoser_core::{EventHook, Service, ServiceEvent, ServiceTree, TaskResult};
use parking_lot::RwLock;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::endpoint::{SinkRef, SourceRef};
use super::process::{ProcState, Process, ProcessConfig, resolve_executable};
use super::valve::{InValve, OutValve};
use super::variables::{Sink, Spout};
use super::{Settings, Supervisor, SupervisorInner};
use crate::command::{Arg, Direction};
use crate::error::{
    ExecutableNotFoundSnafu, ExitInterruptedSnafu, NoSuchNodeSnafu, NoSuchPortSnafu,
    NoSuchProcessSnafu, NoSuchVariableSnafu, PipelineDirSnafu, PipelineError,
    ProcessExistsSnafu, ProcessFailedSnafu, StartProcessSnafu, SupervisorError,
    VariableExistsSnafu,
};

/// Something that data can be piped out of.
#[derive(Clone)]
pub enum Outlet {
    Valve(Arc<OutValve>),
    Spout(Arc<Spout>),
}

impl Outlet {
    /// Route this outlet's data to `destination`, replacing any earlier one.
    pub fn send_to(&self, destination: SinkRef) {
        match self {
            Outlet::Valve(valve) => valve.send_to(destination),
            Outlet::Spout(spout) => spout.send_to(destination),
        }
    }
}

pub struct Pipeline {
    name: String,
    dir: PathBuf,
    settings: Settings,
    tree: ServiceTree,
    creator: Weak<SupervisorInner>,
    processes: RwLock<HashMap<String, Arc<Process>>>,
    spouts: RwLock<HashMap<String, Arc<Spout>>>,
    sinks: RwLock<HashMap<String, Arc<Sink>>>,
}

impl Pipeline {
    pub(crate) fn new(
        name: impl Into<String>,
        dir: PathBuf,
        settings: Settings,
        creator: Weak<SupervisorInner>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        std::fs::create_dir_all(&dir).context(PipelineDirSnafu { path: &dir })?;

        let tree = ServiceTree::new(name.clone(), settings.restart.clone())
            .with_hook(given_up_hook());
        Ok(Self {
            name,
            dir,
            settings,
            tree,
            creator,
            processes: RwLock::new(HashMap::new()),
            spouts: RwLock::new(HashMap::new()),
            sinks: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve `exe`, build the process and hand it to the pipeline's tree.
    pub fn start_process(
        &self,
        name: &str,
        exe: &str,
        argv: Vec<Arg>,
        ports: BTreeMap<String, Direction>,
    ) -> Result<Arc<Process>, PipelineError> {
        ensure!(
            !self.processes.read().contains_key(name),
            ProcessExistsSnafu {
                pipeline: &self.name,
                name,
            }
        );
        let path = resolve_executable(exe).context(ExecutableNotFoundSnafu { exe })?;

        let mut config = ProcessConfig::new(self.dir.join(format!("process.{name}")))
            .with_argv(argv)
            .with_kill_grace(self.settings.kill_grace);
        config.ports = ports;
        let process = Process::new(format!("/{}/{name}", self.name), path, config)
            .context(StartProcessSnafu { name })?;
        let process = Arc::new(process);

        {
            let mut processes = self.processes.write();
            ensure!(
                !processes.contains_key(name),
                ProcessExistsSnafu {
                    pipeline: &self.name,
                    name,
                }
            );
            processes.insert(name.to_string(), process.clone());
        }
        self.tree.add(process.clone());
        info!(pipeline = %self.name, process = name, exe = %process.exe().display(), "Process added");
        Ok(process)
    }

    fn ensure_free_variable(&self, name: &str) -> Result<(), PipelineError> {
        ensure!(
            !self.spouts.read().contains_key(name) && !self.sinks.read().contains_key(name),
            VariableExistsSnafu {
                pipeline: &self.name,
                name,
            }
        );
        Ok(())
    }

    /// Register a data source. Its connector is served by the pipeline tree.
    pub fn create_spout(&self, name: &str, source: SourceRef) -> Result<Arc<Spout>, PipelineError> {
        self.ensure_free_variable(name)?;
        let spout = Arc::new(Spout::new(format!("/{}/{name}", self.name), source));
        self.spouts.write().insert(name.to_string(), spout.clone());
        self.tree.add(spout.clone());
        debug!(pipeline = %self.name, spout = name, "Spout created");
        Ok(spout)
    }

    /// Register a data destination.
    pub fn create_sink(&self, name: &str, destination: SinkRef) -> Result<Arc<Sink>, PipelineError> {
        self.ensure_free_variable(name)?;
        let sink = Arc::new(Sink::new(format!("/{}/{name}", self.name), destination));
        self.sinks.write().insert(name.to_string(), sink.clone());
        debug!(pipeline = %self.name, sink = name, "Sink created");
        Ok(sink)
    }

    pub fn update_spout(&self, name: &str, source: SourceRef) -> Result<(), PipelineError> {
        self.find_source(name)?.update(source);
        Ok(())
    }

    pub fn update_sink(&self, name: &str, destination: SinkRef) -> Result<(), PipelineError> {
        self.find_sink(name)?.update(destination);
        Ok(())
    }

    pub fn has_spout(&self, name: &str) -> bool {
        self.spouts.read().contains_key(name)
    }

    pub fn has_sink(&self, name: &str) -> bool {
        self.sinks.read().contains_key(name)
    }

    pub fn find_process(&self, name: &str) -> Result<Arc<Process>, PipelineError> {
        self.processes
            .read()
            .get(name)
            .cloned()
            .context(NoSuchProcessSnafu {
                pipeline: &self.name,
                name,
            })
    }

    pub fn find_in(&self, process: &str, port: &str) -> Result<Arc<InValve>, PipelineError> {
        let proc = self.find_process(process)?;
        proc.in_valve(port).cloned().context(NoSuchPortSnafu {
            process,
            port,
            direction: "in",
            available: proc.in_ports().collect::<Vec<_>>().join(", "),
        })
    }

    pub fn find_out(&self, process: &str, port: &str) -> Result<Arc<OutValve>, PipelineError> {
        let proc = self.find_process(process)?;
        proc.out_valve(port).cloned().context(NoSuchPortSnafu {
            process,
            port,
            direction: "out",
            available: proc.out_ports().collect::<Vec<_>>().join(", "),
        })
    }

    pub fn find_source(&self, name: &str) -> Result<Arc<Spout>, PipelineError> {
        self.spouts
            .read()
            .get(name)
            .cloned()
            .context(NoSuchVariableSnafu {
                pipeline: &self.name,
                name,
                kind: "source",
            })
    }

    pub fn find_sink(&self, name: &str) -> Result<Arc<Sink>, PipelineError> {
        self.sinks
            .read()
            .get(name)
            .cloned()
            .context(NoSuchVariableSnafu {
                pipeline: &self.name,
                name,
                kind: "sink",
            })
    }

    /// An output port when `port` is given, otherwise a spout.
    pub fn find_outlet(&self, node: &str, port: Option<&str>) -> Result<Outlet, PipelineError> {
        match port {
            Some(port) => self.find_out(node, port).map(Outlet::Valve),
            None => self.find_source(node).map(Outlet::Spout),
        }
    }

    /// An input port when `port` is given, otherwise a sink.
    pub fn find_inlet(&self, node: &str, port: Option<&str>) -> Result<SinkRef, PipelineError> {
        match port {
            Some(port) => Ok(self.find_in(node, port)?),
            None => Ok(self.find_sink(node)?),
        }
    }

    /// Wait for a process to finish, or for a sink to be closed, then stop
    /// the pipeline.
    pub async fn exit_when(&self, shutdown: &CancellationToken, node: &str) -> Result<(), PipelineError> {
        let process = self.processes.read().get(node).cloned();
        if let Some(process) = process {
            let waited = process
                .wait(shutdown, &[ProcState::Finished, ProcState::Error])
                .await;
            if let Ok(info) = &waited
                && let Some(err) = &info.error
            {
                warn!(pipeline = %self.name, process = node, state = %info.state, error = %err, "Exit process did not succeed");
            }
            self.stop_logged().await;
            waited.context(ProcessFailedSnafu { name: node })?;
            return Ok(());
        }

        let sink = self.sinks.read().get(node).cloned();
        if let Some(sink) = sink {
            let closed = sink.wait_closed(shutdown).await;
            self.stop_logged().await;
            ensure!(
                closed,
                ExitInterruptedSnafu {
                    pipeline: &self.name,
                    name: node,
                }
            );
            return Ok(());
        }

        NoSuchNodeSnafu {
            pipeline: &self.name,
            name: node,
        }
        .fail()
    }

    /// Remove this pipeline from its supervisor, stopping everything in it.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        match self.creator.upgrade() {
            Some(inner) => Supervisor::from_inner(inner).remove_pipeline(&self.name).await,
            None => Ok(()),
        }
    }

    async fn stop_logged(&self) {
        if let Err(e) = self.stop().await {
            warn!(pipeline = %self.name, error = %e, "Failed to stop pipeline");
        }
    }
}

/// Mark processes the tree stopped restarting as errored.
fn given_up_hook() -> EventHook {
    Arc::new(|event: &ServiceEvent| {
        if event.restarting {
            return;
        }
        let Some(err) = &event.error else {
            return;
        };
        if let Some(process) = event.service.as_any().downcast_ref::<Process>() {
            process.mark_given_up(err);
        }
    })
}

#[async_trait]
impl Service for Pipeline {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn serve(&self, shutdown: CancellationToken) -> TaskResult {
        info!(pipeline = %self.name, "Pipeline started");
        let result = self.tree.run(shutdown).await;
        info!(pipeline = %self.name, "Pipeline stopped");
        result
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
