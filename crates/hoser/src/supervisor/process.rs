//! Supervised OS processes.
//!
//! A `Process` owns one valve per port and runs its executable once per call
//! to `serve`. The service tree it is registered in decides whether a failed
//! run is retried. Callers observe progress through the `ProcInfo` record,
//! published on a watch channel so waiters are woken on every change.

use std::any::Any;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hoser_core::emit;
use hoser_core::metrics::events::{ExitKind, ProcessExited, ProcessStarted};
use hoser_core::{Service, TaskError, TaskOutput, TaskResult};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use snafu::prelude::*;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::valve::{InValve, OutValve, PIPES_DIR, STDIN, STDOUT};
use crate::command::{Arg, Direction};
use crate::error::{
    ConnectorError, ExitedSnafu, PortDirectionSnafu, ProcessDirSnafu, ProcessError,
    SignaledSnafu, SpawnSnafu, ValveSnafu, WaitChildSnafu, WaitInterruptedSnafu,
};

/// Lifecycle of a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProcState {
    #[default]
    NotStarted,
    Running,
    /// The last run ended and will not be retried.
    Finished,
    /// The service tree gave up restarting the process.
    Error,
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcState::NotStarted => "not started",
            ProcState::Running => "running",
            ProcState::Finished => "finished",
            ProcState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of a process's state.
#[derive(Debug, Clone, Default)]
pub struct ProcInfo {
    pub state: ProcState,
    /// Exit status of the last run. `-1` when the child was hung up on.
    pub exit_code: i32,
    pub error: Option<Arc<ProcessError>>,
}

/// Everything needed to build a process besides its name and executable.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Private working directory. FIFOs live in its `namedpipes` subdirectory.
    pub dir: PathBuf,
    pub argv: Vec<Arg>,
    /// Ports declared outside of argv.
    pub ports: BTreeMap<String, Direction>,
    /// How long a hung-up child may take to exit before it is killed.
    pub kill_grace: Duration,
}

impl ProcessConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            argv: Vec::new(),
            ports: BTreeMap::new(),
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn with_argv(mut self, argv: Vec<Arg>) -> Self {
        self.argv = argv;
        self
    }

    pub fn with_port(mut self, name: impl Into<String>, direction: Direction) -> Self {
        self.ports.insert(name.into(), direction);
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }
}

pub struct Process {
    name: String,
    exe: PathBuf,
    argv: Vec<Arg>,
    dir: PathBuf,
    kill_grace: Duration,
    stdin: Arc<InValve>,
    stdout: Arc<OutValve>,
    ins: BTreeMap<String, Arc<InValve>>,
    outs: BTreeMap<String, Arc<OutValve>>,
    info: watch::Sender<ProcInfo>,
}

impl Process {
    /// Build a process and create the FIFOs for all of its ports.
    ///
    /// Ports come from `config.ports` and from port arguments in argv.
    /// `stdin` and `stdout` are always present.
    pub fn new(
        name: impl Into<String>,
        exe: impl Into<PathBuf>,
        config: ProcessConfig,
    ) -> Result<Self, ProcessError> {
        let name = name.into();
        let pipes = config.dir.join(PIPES_DIR);
        std::fs::create_dir_all(&pipes).context(ProcessDirSnafu {
            name: &name,
            path: &pipes,
        })?;

        let ports = collect_ports(&name, &config)?;
        let stdin = Arc::new(InValve::create(&pipes, STDIN).context(ValveSnafu { name: &name })?);
        let stdout = Arc::new(
            OutValve::create(&pipes, STDOUT, format!("{name}[{STDOUT}]"))
                .context(ValveSnafu { name: &name })?,
        );
        let mut ins = BTreeMap::from([(STDIN.to_string(), stdin.clone())]);
        let mut outs = BTreeMap::from([(STDOUT.to_string(), stdout.clone())]);

        for (port, direction) in ports {
            if port == STDIN || port == STDOUT {
                continue;
            }
            match direction {
                Direction::In => {
                    let valve = InValve::create(&pipes, &port).context(ValveSnafu { name: &name })?;
                    ins.insert(port, Arc::new(valve));
                }
                Direction::Out => {
                    let label = format!("{name}[{port}]");
                    let valve =
                        OutValve::create(&pipes, &port, label).context(ValveSnafu { name: &name })?;
                    outs.insert(port, Arc::new(valve));
                }
            }
        }

        Ok(Self {
            name,
            exe: exe.into(),
            argv: config.argv,
            dir: config.dir,
            kill_grace: config.kill_grace,
            stdin,
            stdout,
            ins,
            outs,
            info: watch::Sender::new(ProcInfo::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn in_valve(&self, port: &str) -> Option<&Arc<InValve>> {
        self.ins.get(port)
    }

    pub fn out_valve(&self, port: &str) -> Option<&Arc<OutValve>> {
        self.outs.get(port)
    }

    pub fn in_ports(&self) -> impl Iterator<Item = &str> {
        self.ins.keys().map(String::as_str)
    }

    pub fn out_ports(&self) -> impl Iterator<Item = &str> {
        self.outs.keys().map(String::as_str)
    }

    pub fn info(&self) -> ProcInfo {
        self.info.borrow().clone()
    }

    pub fn state(&self) -> ProcState {
        self.info.borrow().state
    }

    /// Arguments handed to the executable, with ports resolved to FIFO paths.
    pub fn command_args(&self) -> Vec<OsString> {
        // Longest names first so `$ab` is not consumed by a port named `a`.
        let mut substitutions: Vec<(String, &Path)> = self
            .ins
            .iter()
            .map(|(port, valve)| (port, valve.path()))
            .chain(self.outs.iter().map(|(port, valve)| (port, valve.path())))
            .filter(|(port, _)| port.as_str() != STDIN && port.as_str() != STDOUT)
            .map(|(port, path)| (format!("${port}"), path))
            .collect();
        substitutions.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        self.argv
            .iter()
            .map(|arg| match arg {
                Arg::Port { name, direction } => {
                    let path = match direction {
                        Direction::In => self.ins.get(name).map(|v| v.path()),
                        Direction::Out => self.outs.get(name).map(|v| v.path()),
                    };
                    path.map(|p| p.as_os_str().to_owned()).unwrap_or_default()
                }
                Arg::Literal(text) => {
                    let mut text = text.clone();
                    for (token, path) in &substitutions {
                        if text.contains(token.as_str()) {
                            text = text.replace(token.as_str(), &path.to_string_lossy());
                        }
                    }
                    OsString::from(text)
                }
            })
            .collect()
    }

    /// Run the executable once, relaying its output until it exits.
    ///
    /// Returns the exit code. A child that exits cleanly or is hung up on
    /// succeeds; any other exit is an error.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<i32, Arc<ProcessError>> {
        for valve in self.ins.values() {
            valve.open(shutdown);
        }
        for valve in self.outs.values() {
            valve.open(shutdown);
        }

        let result = self.run_child(shutdown).await;
        self.close_valves();

        let status = result.map_err(Arc::new)?;
        let (code, outcome, kind) = self.exit_outcome(status);
        let error = outcome.err().map(Arc::new);

        emit!(ProcessExited {
            process: self.name.clone(),
            kind,
        });
        self.change_state(|info| {
            info.state = ProcState::Finished;
            info.exit_code = code;
            info.error = error.clone();
        });

        match error {
            None => Ok(code),
            Some(err) => Err(err),
        }
    }

    async fn run_child(&self, shutdown: &CancellationToken) -> Result<ExitStatus, ProcessError> {
        let stdin = self
            .stdin
            .open_stdin(shutdown)
            .await
            .context(ValveSnafu { name: &self.name })?;
        let stdout = self
            .stdout
            .open_stdout(shutdown)
            .await
            .context(ValveSnafu { name: &self.name })?;

        let mut command = Command::new(&self.exe);
        command
            .args(self.command_args())
            .current_dir(&self.dir)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let spawned = command.spawn();
        // Our copies of the child's stdio must be closed for end of stream to
        // reach the relays.
        drop(command);
        let mut child = spawned.context(SpawnSnafu {
            name: &self.name,
            exe: &self.exe,
        })?;

        info!(process = %self.name, pid = ?child.id(), exe = %self.exe.display(), "Process started");
        emit!(ProcessStarted {
            process: self.name.clone(),
        });
        self.change_state(|info| {
            info.state = ProcState::Running;
            info.exit_code = 0;
            info.error = None;
        });

        let mut relays = JoinSet::new();
        for valve in self.outs.values() {
            let valve = valve.clone();
            let shutdown = shutdown.clone();
            relays.spawn(async move {
                let result = valve.relay(&shutdown).await;
                (valve, result)
            });
        }

        let status = self.wait_child(&mut child, shutdown).await;

        for valve in self.ins.values() {
            valve.close();
        }
        for valve in self.outs.values() {
            valve.finish();
        }
        while let Some(joined) = relays.join_next().await {
            let Ok((valve, result)) = joined else {
                warn!(process = %self.name, "Relay task panicked");
                continue;
            };
            match result {
                Ok(bytes) => debug!(process = %self.name, port = valve.port(), bytes, "Relay drained"),
                Err(ConnectorError::Detached { .. } | ConnectorError::ConnectorCancelled { .. }) => {
                    debug!(process = %self.name, port = valve.port(), "Relay stopped without a peer")
                }
                Err(e) => warn!(process = %self.name, port = valve.port(), error = %e, "Relay failed"),
            }
        }

        status
    }

    /// Wait for the child, hanging up on it when `shutdown` fires and killing
    /// it if it is still around after the grace period.
    async fn wait_child(
        &self,
        child: &mut Child,
        shutdown: &CancellationToken,
    ) -> Result<ExitStatus, ProcessError> {
        tokio::select! {
            status = child.wait() => return status.context(WaitChildSnafu { name: &self.name }),
            _ = shutdown.cancelled() => {}
        }

        if let Some(pid) = child.id() {
            debug!(process = %self.name, pid, "Sending SIGHUP");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                warn!(process = %self.name, pid, error = %e, "Failed to send SIGHUP");
            }
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(status) => status.context(WaitChildSnafu { name: &self.name }),
            Err(_) => {
                warn!(
                    process = %self.name,
                    grace_ms = self.kill_grace.as_millis() as u64,
                    "Process ignored SIGHUP, killing"
                );
                child
                    .kill()
                    .await
                    .context(WaitChildSnafu { name: &self.name })?;
                child.wait().await.context(WaitChildSnafu { name: &self.name })
            }
        }
    }

    fn exit_outcome(&self, status: ExitStatus) -> (i32, Result<(), ProcessError>, ExitKind) {
        if let Some(code) = status.code() {
            debug!(process = %self.name, code, "Process exited");
            if code == 0 {
                return (0, Ok(()), ExitKind::Success);
            }
            let err = ExitedSnafu {
                name: &self.name,
                code,
            }
            .build();
            return (code, Err(err), ExitKind::Failure);
        }

        let signal = status.signal().unwrap_or_default();
        debug!(process = %self.name, signal, "Process terminated by signal");
        if signal == Signal::SIGHUP as i32 {
            return (-1, Ok(()), ExitKind::Signaled);
        }
        let err = SignaledSnafu {
            name: &self.name,
            signal,
        }
        .build();
        (-1, Err(err), ExitKind::Signaled)
    }

    fn close_valves(&self) {
        for valve in self.ins.values() {
            valve.close();
        }
        for valve in self.outs.values() {
            valve.close();
        }
    }

    fn change_state(&self, modify: impl FnOnce(&mut ProcInfo)) {
        self.info.send_modify(|info| {
            let old = info.state;
            modify(info);
            if old != info.state {
                debug!(process = %self.name, from = %old, to = %info.state, "State changed");
            }
        });
    }

    /// Record that the service tree stopped restarting this process.
    pub fn mark_given_up(&self, err: &TaskError) {
        warn!(process = %self.name, error = %err, "Process given up");
        let given_up = ProcessError::GivenUp {
            name: self.name.clone(),
            message: err.to_string(),
        };
        self.change_state(|info| {
            info.state = ProcState::Error;
            info.error = Some(Arc::new(given_up));
        });
    }

    /// Wait until the process is in one of `wanted`.
    pub async fn wait(
        &self,
        shutdown: &CancellationToken,
        wanted: &[ProcState],
    ) -> Result<ProcInfo, ProcessError> {
        let mut rx = self.info.subscribe();
        let waited = shutdown
            .run_until_cancelled(rx.wait_for(|info| wanted.contains(&info.state)))
            .await;
        match waited {
            Some(Ok(info)) => Ok(info.clone()),
            _ => self.interrupted(wanted),
        }
    }

    /// `wait`, bounded by `timeout`.
    pub async fn wait_timeout(
        &self,
        shutdown: &CancellationToken,
        timeout: Duration,
        wanted: &[ProcState],
    ) -> Result<ProcInfo, ProcessError> {
        match tokio::time::timeout(timeout, self.wait(shutdown, wanted)).await {
            Ok(result) => result,
            Err(_) => self.interrupted(wanted),
        }
    }

    fn interrupted(&self, wanted: &[ProcState]) -> Result<ProcInfo, ProcessError> {
        let wanted = wanted
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        WaitInterruptedSnafu {
            name: &self.name,
            wanted,
            state: self.state(),
        }
        .fail()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("exe", &self.exe)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Service for Process {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn serve(&self, shutdown: CancellationToken) -> TaskResult {
        match self.run(&shutdown).await {
            Ok(code) => Ok(TaskOutput::with_message(format!("exited with status {code}"))),
            Err(err) => Err(TaskError::failed(err)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn collect_ports(
    name: &str,
    config: &ProcessConfig,
) -> Result<BTreeMap<String, Direction>, ProcessError> {
    let declared = config
        .ports
        .iter()
        .map(|(port, direction)| (port.clone(), *direction));
    let argv_ports = config.argv.iter().filter_map(|arg| match arg {
        Arg::Port { name, direction } => Some((name.clone(), *direction)),
        Arg::Literal(_) => None,
    });
    let standard = [
        (STDIN.to_string(), Direction::In),
        (STDOUT.to_string(), Direction::Out),
    ];

    let mut ports = BTreeMap::new();
    for (port, direction) in declared.chain(argv_ports).chain(standard) {
        if let Some(existing) = ports.insert(port.clone(), direction)
            && existing != direction
        {
            return PortDirectionSnafu { name, port }.fail();
        }
    }
    Ok(ports)
}

/// Find `exe` the way a shell would. Names containing a slash are checked
/// directly; bare names are searched for on `PATH`.
pub fn resolve_executable(exe: &str) -> Option<PathBuf> {
    if exe.is_empty() {
        return None;
    }
    if exe.contains('/') {
        let candidate = PathBuf::from(exe);
        return is_executable(&candidate).then_some(candidate);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(exe))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::endpoint::{BufferSink, ByteSink};
    use tempfile::TempDir;

    fn which(exe: &str) -> PathBuf {
        resolve_executable(exe).unwrap()
    }

    fn process(dir: &TempDir, exe: &str, argv: &[&str]) -> Arc<Process> {
        let argv = argv.iter().map(|a| Arg::literal(*a)).collect();
        let config = ProcessConfig::new(dir.path().join("process.test")).with_argv(argv);
        Arc::new(Process::new("/test/proc", which(exe), config).unwrap())
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProcState::NotStarted.to_string(), "not started");
        assert_eq!(ProcState::Running.to_string(), "running");
        assert_eq!(ProcState::Finished.to_string(), "finished");
        assert_eq!(ProcState::Error.to_string(), "error");
    }

    #[test]
    fn test_resolve_executable() {
        assert!(resolve_executable("sh").is_some());
        assert!(resolve_executable("/bin/sh").is_some());
        assert!(resolve_executable("definitely-not-a-real-binary-4821").is_none());
        assert!(resolve_executable("").is_none());

        // Not executable.
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, "data").unwrap();
        assert!(resolve_executable(plain.to_str().unwrap()).is_none());
    }

    #[test]
    fn test_ports_from_argv_and_declarations() {
        let dir = TempDir::new().unwrap();
        let config = ProcessConfig::new(dir.path())
            .with_argv(vec![Arg::input("a"), Arg::literal("-"), Arg::output("b")])
            .with_port("c", Direction::In);
        let proc = Process::new("/p/cat", which("cat"), config).unwrap();

        assert_eq!(proc.in_ports().collect::<Vec<_>>(), vec!["a", "c", "stdin"]);
        assert_eq!(proc.out_ports().collect::<Vec<_>>(), vec!["b", "stdout"]);
        assert!(dir.path().join(PIPES_DIR).join("a").exists());
        assert!(dir.path().join(PIPES_DIR).join("stdout").exists());
    }

    #[test]
    fn test_conflicting_port_direction() {
        let dir = TempDir::new().unwrap();
        let config = ProcessConfig::new(dir.path())
            .with_argv(vec![Arg::output("a")])
            .with_port("a", Direction::In);
        let err = Process::new("/p/cat", which("cat"), config).unwrap_err();
        assert!(matches!(err, ProcessError::PortDirection { port, .. } if port == "a"));

        let config = ProcessConfig::new(dir.path()).with_port(STDIN, Direction::Out);
        let err = Process::new("/p/cat", which("cat"), config).unwrap_err();
        assert!(matches!(err, ProcessError::PortDirection { port, .. } if port == STDIN));
    }

    #[test]
    fn test_argv_substitution() {
        let dir = TempDir::new().unwrap();
        let config = ProcessConfig::new(dir.path())
            .with_argv(vec![
                Arg::literal("--to=$copy"),
                Arg::literal("$copyright"),
                Arg::input("src"),
            ])
            .with_port("copy", Direction::Out)
            .with_port("copyright", Direction::In);
        let proc = Process::new("/p/tee", which("tee"), config).unwrap();

        let pipes = dir.path().join(PIPES_DIR);
        let args = proc.command_args();
        assert_eq!(
            args[0],
            OsString::from(format!("--to={}", pipes.join("copy").display()))
        );
        assert_eq!(args[1], pipes.join("copyright").into_os_string());
        assert_eq!(args[2], pipes.join("src").into_os_string());
    }

    #[tokio::test]
    async fn test_clean_exit_finishes() {
        let dir = TempDir::new().unwrap();
        let proc = process(&dir, "true", &[]);
        let code = proc.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(code, 0);
        let info = proc.info();
        assert_eq!(info.state, ProcState::Finished);
        assert!(info.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_exit_records_error() {
        let dir = TempDir::new().unwrap();
        let proc = process(&dir, "false", &[]);
        let err = proc.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(*err, ProcessError::Exited { code: 1, .. }));
        let info = proc.info();
        assert_eq!(info.state, ProcState::Finished);
        assert_eq!(info.exit_code, 1);
        assert!(info.error.is_some());
    }

    #[tokio::test]
    async fn test_cat_copies_stdin_to_stdout() {
        let dir = TempDir::new().unwrap();
        let proc = process(&dir, "cat", &[]);
        let sink = Arc::new(BufferSink::new());
        proc.out_valve(STDOUT).unwrap().send_to(sink.clone());

        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let proc = proc.clone();
            let shutdown = shutdown.clone();
            async move { proc.run(&shutdown).await }
        });

        proc.wait_timeout(&shutdown, Duration::from_secs(5), &[ProcState::Running])
            .await
            .unwrap();
        let stdin = proc.in_valve(STDIN).unwrap().clone();
        stdin.write(b"cats\ndogs\n").await.unwrap();
        ByteSink::close(stdin.as_ref()).await.unwrap();

        assert_eq!(run.await.unwrap().unwrap(), 0);
        assert_eq!(sink.contents_string(), "cats\ndogs\n");
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_hangs_up() {
        let dir = TempDir::new().unwrap();
        let proc = process(&dir, "sleep", &["30"]);
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let proc = proc.clone();
            let shutdown = shutdown.clone();
            async move { proc.run(&shutdown).await }
        });

        proc.wait_timeout(&CancellationToken::new(), Duration::from_secs(5), &[ProcState::Running])
            .await
            .unwrap();
        shutdown.cancel();

        assert_eq!(run.await.unwrap().unwrap(), -1);
        assert_eq!(proc.state(), ProcState::Finished);
    }

    #[tokio::test]
    async fn test_ignored_hangup_is_killed_after_grace() {
        let dir = TempDir::new().unwrap();
        let config = ProcessConfig::new(dir.path())
            .with_argv(vec![
                Arg::literal("-c"),
                Arg::literal("trap '' HUP; exec sleep 30"),
            ])
            .with_kill_grace(Duration::from_millis(100));
        let proc = Arc::new(Process::new("/test/stubborn", which("sh"), config).unwrap());
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let proc = proc.clone();
            let shutdown = shutdown.clone();
            async move { proc.run(&shutdown).await }
        });

        proc.wait_timeout(&CancellationToken::new(), Duration::from_secs(5), &[ProcState::Running])
            .await
            .unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(*err, ProcessError::Signaled { signal: 9, .. }));
    }

    #[tokio::test]
    async fn test_wait_timeout_names_stuck_state() {
        let dir = TempDir::new().unwrap();
        let proc = process(&dir, "true", &[]);
        let err = proc
            .wait_timeout(
                &CancellationToken::new(),
                Duration::from_millis(50),
                &[ProcState::Running, ProcState::Finished],
            )
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            ProcessError::WaitInterrupted { state: ProcState::NotStarted, .. }
        ));
        assert!(err.to_string().contains("[running, finished]"));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_in_state() {
        let dir = TempDir::new().unwrap();
        let proc = process(&dir, "true", &[]);
        let info = proc
            .wait(&CancellationToken::new(), &[ProcState::NotStarted])
            .await
            .unwrap();
        assert_eq!(info.state, ProcState::NotStarted);
    }

    #[tokio::test]
    async fn test_mark_given_up() {
        let dir = TempDir::new().unwrap();
        let proc = process(&dir, "true", &[]);
        proc.mark_given_up(&TaskError::Failed("too many restarts".into()));

        let info = proc.info();
        assert_eq!(info.state, ProcState::Error);
        assert!(matches!(
            info.error.as_deref(),
            Some(ProcessError::GivenUp { message, .. }) if message.contains("too many restarts")
        ));
    }
}
