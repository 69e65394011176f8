//! Named pipe plumbing.
//!
//! Opening a FIFO blocks until the other end is opened too. `FifoSession`
//! runs that open on the blocking pool and exposes the resulting async pipe
//! handle once it is ready. An abandoned open is unblocked by briefly opening
//! the opposite end without blocking, so no blocking thread outlives its
//! session.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::stat::Mode;
use snafu::IntoError;
use snafu::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::{Mutex, MutexGuard, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CreateFifoSnafu, NotOpenedSnafu, OpenFifoSnafu, ValveCancelledSnafu, ValveError};

/// Create a FIFO at `path`. An existing FIFO is reused.
pub fn create_fifo(path: &Path) -> Result<(), ValveError> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o644)) {
        Err(Errno::EEXIST) if is_fifo(path) => Ok(()),
        result => result.context(CreateFifoSnafu { path }),
    }
}

fn is_fifo(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).is_ok_and(|meta| meta.file_type().is_fifo())
}

const POKE_INTERVAL: Duration = Duration::from_millis(20);
const PEER_RETRY: Duration = Duration::from_millis(5);

/// Clear `O_NONBLOCK` so a child inherits an ordinary blocking descriptor.
fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags & !OFlag::O_NONBLOCK))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoEnd {
    Read,
    Write,
}

impl FifoEnd {
    pub fn opposite(self) -> Self {
        match self {
            FifoEnd::Read => FifoEnd::Write,
            FifoEnd::Write => FifoEnd::Read,
        }
    }

    /// Open this end, blocking until a peer opens the other.
    pub fn open_blocking(self, path: &Path) -> io::Result<File> {
        match self {
            FifoEnd::Read => OpenOptions::new().read(true).open(path),
            FifoEnd::Write => OpenOptions::new().write(true).open(path),
        }
    }

    /// Open this end without waiting for a peer.
    pub fn open_nonblocking(self, path: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        match self {
            FifoEnd::Read => options.read(true),
            FifoEnd::Write => options.write(true),
        };
        options.custom_flags(nix::libc::O_NONBLOCK).open(path)
    }

    /// Open and immediately close this end, waking anyone blocked opening
    /// the other end.
    fn poke(self, path: &Path) {
        if let Err(e) = self.open_nonblocking(path) {
            trace!(path = %path.display(), error = %e, "Poke open failed");
        }
    }
}

/// Async handle for one end of a FIFO.
pub trait FromFifo: Sized + Send + Sync + 'static {
    const END: FifoEnd;

    fn from_fifo(file: File) -> io::Result<Self>;
}

impl FromFifo for pipe::Sender {
    const END: FifoEnd = FifoEnd::Write;

    fn from_fifo(file: File) -> io::Result<Self> {
        pipe::Sender::from_file(file)
    }
}

impl FromFifo for pipe::Receiver {
    const END: FifoEnd = FifoEnd::Read;

    fn from_fifo(file: File) -> io::Result<Self> {
        pipe::Receiver::from_file(file)
    }
}

enum SessionState<T> {
    Opening(oneshot::Receiver<io::Result<File>>),
    Ready(T),
    Failed(io::ErrorKind, String),
}

/// One open of a FIFO end, from the background open until close.
pub struct FifoSession<T> {
    port: String,
    path: PathBuf,
    end: FifoEnd,
    // Aborts the pending open and any I/O in flight.
    cancel: CancellationToken,
    // Child of `cancel`. Completes the pending open without a real peer.
    release: CancellationToken,
    opened: Arc<AtomicBool>,
    state: Mutex<SessionState<T>>,
}

impl<T: FromFifo> FifoSession<T> {
    fn start(port: &str, path: &Path, shutdown: &CancellationToken) -> Arc<Self> {
        let cancel = shutdown.child_token();
        let release = cancel.child_token();
        let opened = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let blocking = {
            let path = path.to_path_buf();
            let opened = opened.clone();
            let release = release.clone();
            tokio::task::spawn_blocking(move || {
                let result = if release.is_cancelled() {
                    T::END.open_nonblocking(&path)
                } else {
                    T::END.open_blocking(&path)
                };
                opened.store(true, Ordering::Release);
                result
            })
        };

        {
            let path = path.to_path_buf();
            let release = release.clone();
            let opened = opened.clone();
            tokio::spawn(async move {
                let mut blocking = blocking;
                let joined = tokio::select! {
                    joined = &mut blocking => joined,
                    _ = release.cancelled() => loop {
                        // The blocking open may not have reached the kernel
                        // yet, so keep poking until it returns.
                        if !opened.load(Ordering::Acquire) {
                            T::END.opposite().poke(&path);
                        }
                        if let Ok(joined) = tokio::time::timeout(POKE_INTERVAL, &mut blocking).await {
                            break joined;
                        }
                    },
                };
                let result = joined.unwrap_or_else(|e| Err(io::Error::other(e)));
                let _ = tx.send(result);
            });
        }

        Arc::new(Self {
            port: port.to_string(),
            path: path.to_path_buf(),
            end: T::END,
            cancel,
            release,
            opened,
            state: Mutex::new(SessionState::Opening(rx)),
        })
    }

    fn cancelled(&self) -> io::Error {
        ValveCancelledSnafu { port: &self.port }.build().into()
    }

    /// Lock the session once the open has completed.
    async fn lock_ready(&self) -> io::Result<MutexGuard<'_, SessionState<T>>> {
        let mut state = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
            state = self.state.lock() => state,
        };

        if let SessionState::Opening(rx) = &mut *state {
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                opened = rx => opened,
            };
            *state = match opened.map(|file| file.and_then(T::from_fifo)) {
                Ok(Ok(handle)) => {
                    debug!(port = %self.port, path = %self.path.display(), "Fifo opened");
                    SessionState::Ready(handle)
                }
                Ok(Err(e)) => SessionState::Failed(e.kind(), e.to_string()),
                Err(_) => SessionState::Failed(io::ErrorKind::Interrupted, "open abandoned".into()),
            };
        }

        if let SessionState::Failed(kind, message) = &*state {
            let source = io::Error::new(*kind, message.clone());
            let err = OpenFifoSnafu { path: &self.path }.into_error(source);
            return Err(err.into());
        }
        Ok(state)
    }
}

impl FifoSession<pipe::Sender> {
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock_ready().await?;
        let SessionState::Ready(sender) = &mut *state else {
            return Err(self.cancelled());
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled()),
            written = sender.write_all(buf) => written.map(|()| buf.len()),
        }
    }
}

impl FifoSession<pipe::Receiver> {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock_ready().await?;
        let SessionState::Ready(receiver) = &mut *state else {
            return Err(self.cancelled());
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled()),
            read = receiver.read(buf) => read,
        }
    }
}

impl<T> Drop for FifoSession<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if !self.opened.load(Ordering::Acquire) {
            self.end.opposite().poke(&self.path);
        }
    }
}

/// A FIFO owned by a process port, reopened for every run of the process.
pub struct NamedPipe<T> {
    port: String,
    path: PathBuf,
    session: parking_lot::Mutex<Option<Arc<FifoSession<T>>>>,
}

impl<T: FromFifo> NamedPipe<T> {
    pub fn create(port: impl Into<String>, path: PathBuf) -> Result<Self, ValveError> {
        create_fifo(&path)?;
        Ok(Self {
            port: port.into(),
            path,
            session: parking_lot::Mutex::new(None),
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start opening our end in the background, replacing any earlier session.
    pub fn open(&self, shutdown: &CancellationToken) {
        let session = FifoSession::start(&self.port, &self.path, shutdown);
        if let Some(previous) = self.session.lock().replace(session) {
            previous.cancel.cancel();
        }
    }

    /// Open the opposite end for a child's standard stream, completing the
    /// rendezvous with our own pending open. The returned file is blocking.
    pub async fn open_peer(&self, shutdown: &CancellationToken) -> Result<File, ValveError> {
        ensure!(
            self.session.lock().is_some(),
            NotOpenedSnafu { port: &self.port }
        );

        let end = T::END.opposite();
        let file = loop {
            match end.open_nonblocking(&self.path) {
                Ok(file) => break file,
                // Writers cannot open before our reader has reached the kernel.
                Err(e) if e.raw_os_error() == Some(nix::libc::ENXIO) => {
                    let waited = shutdown
                        .run_until_cancelled(tokio::time::sleep(PEER_RETRY))
                        .await;
                    ensure!(waited.is_some(), ValveCancelledSnafu { port: &self.port });
                }
                Err(e) => return Err(e).context(OpenFifoSnafu { path: &self.path }),
            }
        };
        set_blocking(&file).context(OpenFifoSnafu { path: &self.path })?;
        Ok(file)
    }

    /// Let a pending open complete even though no peer ever arrived.
    pub fn release_pending(&self) {
        if let Some(session) = self.session.lock().as_ref() {
            session.release.cancel();
        }
    }

    /// Drop our end, failing any I/O in flight.
    pub fn close(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
        }
    }

    fn current(&self) -> io::Result<Arc<FifoSession<T>>> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| NotOpenedSnafu { port: &self.port }.build().into())
    }
}

impl NamedPipe<pipe::Sender> {
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.current()?.write(buf).await
    }
}

impl NamedPipe<pipe::Receiver> {
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.current()?.read(buf).await
    }
}
