//! Executes parsed script commands against a supervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::command::{
    Command, ExitBody, Ident, PipeBody, PipelineBody, SetBody, StartBody,
};
use crate::error::{
    AmbiguousSetSnafu, BadIdentSnafu, InterpreterError, InvalidUrlSnafu, KindMismatchSnafu,
    MissingNodeSnafu, NoSuchPipelineSnafu, NoValueSnafu, OpenFileSnafu, PipelineSnafu,
    ProcessError, StartupWaitSnafu, SupervisorSnafu, UnsupportedSchemeSnafu,
};
use crate::supervisor::{
    FileSink, FileSource, Pipeline, ProcState, SinkRef, SourceRef, Supervisor, TextSource,
};

/// Default bound on how long `start` waits for a process to come up.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(25);

pub struct Interpreter {
    target: Supervisor,
    startup_timeout: Duration,
    base_dir: Option<PathBuf>,
}

impl Interpreter {
    pub fn new(target: Supervisor) -> Self {
        Self {
            target,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            base_dir: None,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Resolve relative `file://` paths against `dir` instead of the
    /// current directory.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn target(&self) -> &Supervisor {
        &self.target
    }

    /// Execute one command. `exit` blocks until its condition is met.
    pub async fn exec(
        &self,
        shutdown: &CancellationToken,
        command: &Command,
    ) -> Result<(), InterpreterError> {
        debug!(command = %command, "Executing");
        match command {
            Command::Pipeline(body) => self.add_pipeline(body),
            Command::Start(body) => self.start(shutdown, body).await,
            Command::Set(body) => self.set(body).await,
            Command::Pipe(body) => self.pipe(body),
            Command::Exit(body) => self.exit(shutdown, body).await,
        }
    }

    fn add_pipeline(&self, body: &PipelineBody) -> Result<(), InterpreterError> {
        let name = if body.id.starts_with('/') {
            parse_ident("id", &body.id)?.pipeline
        } else {
            body.id.clone()
        };
        self.target.add_pipeline(&name).context(SupervisorSnafu)?;
        Ok(())
    }

    async fn start(
        &self,
        shutdown: &CancellationToken,
        body: &StartBody,
    ) -> Result<(), InterpreterError> {
        let id = parse_ident("id", &body.id)?;
        let pipeline = self.pipeline(&id)?;
        let node = node_name(&id, &body.id)?;

        let ports = body
            .ports
            .iter()
            .map(|(name, spec)| (name.clone(), spec.dir))
            .collect();
        let process = pipeline
            .start_process(node, &body.exe, body.argv.clone(), ports)
            .context(PipelineSnafu)?;

        let info = process
            .wait_timeout(
                shutdown,
                self.startup_timeout,
                &[ProcState::Running, ProcState::Finished, ProcState::Error],
            )
            .await
            .context(StartupWaitSnafu)?;
        if info.state == ProcState::Error {
            let message = info
                .error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "failed to start".to_string());
            return Err(ProcessError::GivenUp {
                name: process.name().to_string(),
                message,
            })
            .context(StartupWaitSnafu);
        }
        Ok(())
    }

    async fn set(&self, body: &SetBody) -> Result<(), InterpreterError> {
        let id = parse_ident("id", &body.id)?;
        let pipeline = self.pipeline(&id)?;
        let node = node_name(&id, &body.id)?;
        ensure!(
            !(body.is_sink() && body.is_spout()),
            AmbiguousSetSnafu { id: &body.id }
        );

        if body.is_sink() {
            ensure!(
                !pipeline.has_spout(node),
                KindMismatchSnafu {
                    id: &body.id,
                    existing: "source",
                }
            );
            let sink = self.open_sink(&body.write).await?;
            if pipeline.has_sink(node) {
                pipeline.update_sink(node, sink).context(PipelineSnafu)?;
            } else {
                pipeline.create_sink(node, sink).context(PipelineSnafu)?;
            }
            return Ok(());
        }

        ensure!(body.is_spout(), NoValueSnafu { id: &body.id });
        ensure!(
            !pipeline.has_sink(node),
            KindMismatchSnafu {
                id: &body.id,
                existing: "sink",
            }
        );
        let source = self.open_source(body).await?;
        if pipeline.has_spout(node) {
            pipeline.update_spout(node, source).context(PipelineSnafu)?;
        } else {
            pipeline.create_spout(node, source).context(PipelineSnafu)?;
        }
        Ok(())
    }

    fn pipe(&self, body: &PipeBody) -> Result<(), InterpreterError> {
        let src = parse_ident("src", &body.src)?;
        let dst = parse_ident("dst", &body.dst)?;
        let src_pipeline = self.pipeline(&src)?;
        let dst_pipeline = self.pipeline(&dst)?;

        let outlet = src_pipeline
            .find_outlet(node_name(&src, &body.src)?, src.port_name())
            .context(PipelineSnafu)?;
        let inlet = dst_pipeline
            .find_inlet(node_name(&dst, &body.dst)?, dst.port_name())
            .context(PipelineSnafu)?;
        outlet.send_to(inlet);
        Ok(())
    }

    async fn exit(&self, shutdown: &CancellationToken, body: &ExitBody) -> Result<(), InterpreterError> {
        let id = parse_ident("when", &body.when)?;
        let pipeline = self.pipeline(&id)?;
        pipeline
            .exit_when(shutdown, node_name(&id, &body.when)?)
            .await
            .context(PipelineSnafu)
    }

    fn pipeline(&self, id: &Ident) -> Result<Arc<Pipeline>, InterpreterError> {
        self.target
            .pipeline(&id.pipeline)
            .context(NoSuchPipelineSnafu {
                name: &id.pipeline,
            })
            .context(SupervisorSnafu)
    }

    async fn open_source(&self, body: &SetBody) -> Result<SourceRef, InterpreterError> {
        if !body.text.is_empty() {
            return Ok(Arc::new(TextSource::new(body.text.clone())));
        }
        let path = self.file_path(&body.read)?;
        let source = FileSource::open(&path)
            .await
            .context(OpenFileSnafu { path: &path })?;
        Ok(Arc::new(source))
    }

    async fn open_sink(&self, value: &str) -> Result<SinkRef, InterpreterError> {
        let path = self.file_path(value)?;
        let sink = FileSink::create(&path)
            .await
            .context(OpenFileSnafu { path: &path })?;
        Ok(Arc::new(sink))
    }

    fn file_path(&self, value: &str) -> Result<PathBuf, InterpreterError> {
        let path = file_url_path(value)?;
        Ok(match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        })
    }
}

fn parse_ident(field: &'static str, id: &str) -> Result<Ident, InterpreterError> {
    id.parse().context(BadIdentSnafu { field })
}

fn node_name<'a>(id: &'a Ident, raw: &str) -> Result<&'a str, InterpreterError> {
    id.node_name().context(MissingNodeSnafu { id: raw })
}

/// The path named by a `file://` URL. Host and path are joined, so
/// `file://data/in.txt` is relative and `file:///data/in.txt` is absolute.
pub fn file_url_path(value: &str) -> Result<PathBuf, InterpreterError> {
    let url = Url::parse(value).context(InvalidUrlSnafu { value })?;
    ensure!(
        url.scheme() == "file",
        UnsupportedSchemeSnafu {
            value,
            scheme: url.scheme(),
        }
    );
    // The URL parser lowercases and normalizes the host, so take the raw text.
    let rest = value
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or_default();
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    Ok(Path::new(rest).to_path_buf())
}
