//! Error types for the hoser orchestrator.
//!
//! Variant names are unique across the file so that the generated snafu
//! context selectors do not collide.

use std::path::PathBuf;

use snafu::prelude::*;

use crate::supervisor::ProcState;

pub use hoser_core::error::{ConfigError, MetricsError, TreeError};

/// Errors parsing a `/pipeline/node[port]` identifier.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum IdentError {
    #[snafu(display("identifier is empty"))]
    EmptyIdent,

    #[snafu(display("identifier '{id}' must start with '/'"))]
    NotAbsolute { id: String },

    #[snafu(display("identifier '{id}' does not name a pipeline"))]
    MissingPipeline { id: String },

    #[snafu(display("identifier '{id}' has too many segments, expected /pipeline/node[port]"))]
    TooManySegments { id: String },
}

/// Errors parsing a single script line.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CommandError {
    #[snafu(display("unrecognized command: '{code}'"))]
    UnknownCode { code: String },

    #[snafu(display("command code is {len} bytes long, the limit is {max}"))]
    CodeTooLong { len: usize, max: usize },

    #[snafu(display("command '{code}' has no body"))]
    MissingBody { code: String },

    #[snafu(display("invalid body for '{code}': {source}"))]
    InvalidBody {
        code: String,
        source: serde_json::Error,
    },
}

/// Errors reading a script file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ScriptError {
    #[snafu(display("failed to open script {}: {source}", path.display()))]
    OpenScript {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to read script: {source}"))]
    ReadScript { source: std::io::Error },

    #[snafu(display("line {line}: {source}\n\tcontext: {text}"))]
    ScriptLine {
        line: usize,
        text: String,
        source: CommandError,
    },
}

/// Errors ending a connector's relay loop.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConnectorError {
    #[snafu(display("connector '{name}' was cancelled"))]
    ConnectorCancelled { name: String },

    /// Draining was requested while an endpoint was missing.
    #[snafu(display("connector '{name}' has no {missing} bound"))]
    Detached { name: String, missing: &'static str },

    #[snafu(display("connector '{name}' failed to read its source: {source}"))]
    SourceRead {
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("connector '{name}' write mismatch: read {expected} bytes, wrote {written}"))]
    ShortWrite {
        name: String,
        expected: usize,
        written: usize,
    },
}

/// Errors from the named pipes behind process ports.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValveError {
    #[snafu(display("failed to create fifo {}: {source}", path.display()))]
    CreateFifo { path: PathBuf, source: nix::Error },

    #[snafu(display("valve '{port}' has not been opened"))]
    NotOpened { port: String },

    #[snafu(display("valve '{port}' was closed"))]
    ValveCancelled { port: String },

    #[snafu(display("failed to open fifo {}: {source}", path.display()))]
    OpenFifo {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ValveError {
    /// Find a valve error carried inside an I/O error.
    pub fn from_io(err: &std::io::Error) -> Option<&ValveError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<ValveError>())
    }
}

impl From<ValveError> for std::io::Error {
    fn from(err: ValveError) -> Self {
        std::io::Error::other(err)
    }
}

/// Errors running a managed process.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProcessError {
    #[snafu(display("failed to create directory {} for process '{name}': {source}", path.display()))]
    ProcessDir {
        name: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("process '{name}': {source}"))]
    Valve { name: String, source: ValveError },

    #[snafu(display("port '{port}' of process '{name}' is declared both in and out"))]
    PortDirection { name: String, port: String },

    #[snafu(display("failed to spawn '{}' for process '{name}': {source}", exe.display()))]
    Spawn {
        name: String,
        exe: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed waiting on process '{name}': {source}"))]
    WaitChild {
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("process '{name}' exited with status {code}"))]
    Exited { name: String, code: i32 },

    #[snafu(display("process '{name}' was killed by signal {signal}"))]
    Signaled { name: String, signal: i32 },

    #[snafu(display("waiting for process '{name}' to enter [{wanted}], stuck in '{state}'"))]
    WaitInterrupted {
        name: String,
        wanted: String,
        state: ProcState,
    },

    #[snafu(display("process '{name}' was given up on: {message}"))]
    GivenUp { name: String, message: String },
}

/// Errors building or querying a pipeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    #[snafu(display("pipeline '{pipeline}' already has a process '{name}'"))]
    ProcessExists { pipeline: String, name: String },

    #[snafu(display("pipeline '{pipeline}' already has a variable '{name}'"))]
    VariableExists { pipeline: String, name: String },

    #[snafu(display("executable '{exe}' not found"))]
    ExecutableNotFound { exe: String },

    #[snafu(display("failed to start '{name}': {source}"))]
    StartProcess { name: String, source: ProcessError },

    #[snafu(display("pipeline '{pipeline}' has no process '{name}'"))]
    NoSuchProcess { pipeline: String, name: String },

    #[snafu(display("process '{process}' has no {direction} port '{port}', available: [{available}]"))]
    NoSuchPort {
        process: String,
        port: String,
        direction: &'static str,
        available: String,
    },

    #[snafu(display("pipeline '{pipeline}' has no {kind} variable '{name}'"))]
    NoSuchVariable {
        pipeline: String,
        name: String,
        kind: &'static str,
    },

    #[snafu(display("pipeline '{pipeline}' has no process or sink named '{name}'"))]
    NoSuchNode { pipeline: String, name: String },

    #[snafu(display("process '{name}' failed: {source}"))]
    ProcessFailed { name: String, source: ProcessError },

    #[snafu(display("interrupted waiting for sink '{name}' in pipeline '{pipeline}' to close"))]
    ExitInterrupted { pipeline: String, name: String },

    #[snafu(display("failed to create pipeline directory {}: {source}", path.display()))]
    PipelineDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors managing the set of pipelines.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SupervisorError {
    #[snafu(display("pipeline '{name}' already exists"))]
    PipelineExists { name: String },

    #[snafu(display("no pipeline named '{name}'"))]
    NoSuchPipeline { name: String },

    #[snafu(display("failed to stop pipeline '{name}': {source}"))]
    StopPipeline { name: String, source: TreeError },

    #[snafu(display("failed to create pipeline: {source}"))]
    CreatePipeline { source: PipelineError },

    #[snafu(display("failed to remove work directory {}: {source}", path.display()))]
    RemoveWorkDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors executing a script command.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum InterpreterError {
    #[snafu(display("bad {field} identifier: {source}"))]
    BadIdent {
        field: &'static str,
        source: IdentError,
    },

    #[snafu(display("identifier '{id}' must name a node inside the pipeline"))]
    MissingNode { id: String },

    #[snafu(display("{source}"))]
    Supervisor { source: SupervisorError },

    #[snafu(display("{source}"))]
    Pipeline { source: PipelineError },

    #[snafu(display("{source}"))]
    StartupWait { source: ProcessError },

    #[snafu(display("'{id}' sets both a source and a destination"))]
    AmbiguousSet { id: String },

    #[snafu(display("'{id}' needs one of text, read or write"))]
    NoValue { id: String },

    #[snafu(display("'{id}' is already a {existing}"))]
    KindMismatch { id: String, existing: &'static str },

    #[snafu(display("invalid URL '{value}': {source}"))]
    InvalidUrl {
        value: String,
        source: url::ParseError,
    },

    #[snafu(display("URL scheme '{scheme}' is not supported in '{value}', only file:// is"))]
    UnsupportedScheme { value: String, scheme: String },

    #[snafu(display("failed to open {}: {source}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },
}
