//! hoser: runs pipelines of Unix processes wired together through named pipes.
//!
//! - `command/` - Script syntax: commands, identifiers and the script reader
//! - `supervisor/` - Processes, valves, connectors, variables and pipelines
//! - `interpreter` - Applies commands to a running supervisor
//! - `error` - Error types for every layer

pub mod command;
pub mod error;
pub mod interpreter;
pub mod supervisor;

pub use command::{Command, Ident, read_script, read_script_file};
pub use error::{InterpreterError, PipelineError, ProcessError, ScriptError, SupervisorError};
pub use interpreter::Interpreter;
pub use supervisor::{Pipeline, ProcState, Process, Settings, Supervisor, stopped_cleanly};

// Re-export from hoser-core
pub use hoser_core::{
    ConfigArgs, HoserConfig, TaskError, TaskResult, init_metrics, init_tracing, shutdown_signal,
};
