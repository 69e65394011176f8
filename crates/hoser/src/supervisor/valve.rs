//! Process ports.
//!
//! Every port is a FIFO in the process directory. An `InValve` feeds data
//! into the process; an `OutValve` carries data out of it through its own
//! connector. The standard streams are ports named `stdin` and `stdout`,
//! handed to the child as already-open descriptors; other ports reach the
//! child as paths in its argv.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

use super::connector::Connector;
use super::endpoint::{ByteSink, ByteSource, SinkRef};
use super::fifo::NamedPipe;
use crate::error::{ConnectorError, ValveError};

pub const STDIN: &str = "stdin";
pub const STDOUT: &str = "stdout";

/// Subdirectory of a process directory holding its FIFOs.
pub const PIPES_DIR: &str = "namedpipes";

/// A port that writes into the process.
pub struct InValve {
    pipe: NamedPipe<pipe::Sender>,
}

impl InValve {
    /// Create the FIFO for `port` inside `dir`.
    pub fn create(dir: &Path, port: &str) -> Result<Self, ValveError> {
        Ok(Self {
            pipe: NamedPipe::create(port, dir.join(port))?,
        })
    }

    pub fn port(&self) -> &str {
        self.pipe.port()
    }

    pub fn path(&self) -> &Path {
        self.pipe.path()
    }

    /// Begin opening the write end. Writes wait until the child opens its end.
    pub fn open(&self, shutdown: &CancellationToken) {
        self.pipe.open(shutdown);
    }

    /// Open the read end for a child's standard input. `open` must come first.
    pub async fn open_stdin(&self, shutdown: &CancellationToken) -> Result<File, ValveError> {
        self.pipe.open_peer(shutdown).await
    }

    /// Close the write end; the child sees end of file.
    pub fn close(&self) {
        self.pipe.close();
    }
}

#[async_trait]
impl ByteSink for InValve {
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.pipe.write(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        InValve::close(self);
        Ok(())
    }
}

#[async_trait]
impl ByteSource for NamedPipe<pipe::Receiver> {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        NamedPipe::read(self, buf).await
    }
}

/// A port that reads from the process and relays to a destination.
pub struct OutValve {
    pipe: Arc<NamedPipe<pipe::Receiver>>,
    connector: Connector,
}

impl OutValve {
    /// Create the FIFO for `port` inside `dir`. `name` labels the connector.
    pub fn create(dir: &Path, port: &str, name: impl Into<String>) -> Result<Self, ValveError> {
        let pipe = Arc::new(NamedPipe::create(port, dir.join(port))?);
        let connector = Connector::with_source(name, pipe.clone());
        Ok(Self { pipe, connector })
    }

    pub fn port(&self) -> &str {
        self.pipe.port()
    }

    pub fn path(&self) -> &Path {
        self.pipe.path()
    }

    /// Bind the destination that this port's output is relayed to.
    pub fn send_to(&self, destination: SinkRef) {
        self.connector.send_to(destination);
    }

    /// Begin opening the read end for a new run of the process.
    pub fn open(&self, shutdown: &CancellationToken) {
        self.connector.rearm();
        self.pipe.open(shutdown);
    }

    /// Open the write end for a child's standard output. `open` must come first.
    pub async fn open_stdout(&self, shutdown: &CancellationToken) -> Result<File, ValveError> {
        self.pipe.open_peer(shutdown).await
    }

    /// Read directly from the port, bypassing the connector.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.pipe.read(buf).await
    }

    /// Relay output to the destination until the writer side is done.
    pub async fn relay(&self, shutdown: &CancellationToken) -> Result<u64, ConnectorError> {
        self.connector.serve(shutdown).await
    }

    /// The process has exited: drain what is buffered, but do not wait for
    /// a peer or a destination that never arrived.
    pub fn finish(&self) {
        self.pipe.release_pending();
        self.connector.close_when_idle();
    }

    pub fn close(&self) {
        self.pipe.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::endpoint::BufferSink;
    use std::io::{Read, Write};
    use std::time::Duration;
    use tempfile::TempDir;

    fn cancel_after(delay: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        token
    }

    async fn read_all(valve: &OutValve) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = valve.read(&mut buf).await.unwrap();
            if n == 0 {
                return String::from_utf8(out).unwrap();
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_in_valve_reaches_argv_reader() {
        let dir = TempDir::new().unwrap();
        let valve = InValve::create(dir.path(), "b").unwrap();
        let shutdown = CancellationToken::new();
        valve.open(&shutdown);

        let path = valve.path().to_path_buf();
        let reader = tokio::task::spawn_blocking(move || {
            let mut text = String::new();
            File::open(path).unwrap().read_to_string(&mut text).unwrap();
            text
        });

        ByteSink::write(&valve, b"opened").await.unwrap();
        valve.close();
        assert_eq!(reader.await.unwrap(), "opened");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_out_valve_reads_argv_writer() {
        let dir = TempDir::new().unwrap();
        let valve = OutValve::create(dir.path(), "b", "/p/proc[b]").unwrap();
        let shutdown = CancellationToken::new();
        valve.open(&shutdown);

        let path = valve.path().to_path_buf();
        let writer = tokio::task::spawn_blocking(move || {
            let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            file.write_all(b"opened").unwrap();
        });

        assert_eq!(read_all(&valve).await, "opened");
        writer.await.unwrap();
        valve.close();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let dir = TempDir::new().unwrap();
        let valve = InValve::create(dir.path(), "stdin").unwrap();
        let err = ByteSink::write(&valve, b"x").await.unwrap_err();
        assert!(matches!(
            ValveError::from_io(&err),
            Some(ValveError::NotOpened { .. })
        ));
        assert!(matches!(
            valve.open_stdin(&CancellationToken::new()).await,
            Err(ValveError::NotOpened { .. })
        ));
    }

    #[tokio::test]
    async fn test_forgotten_valve_gives_up_when_cancelled() {
        let dir = TempDir::new().unwrap();
        let valve = InValve::create(dir.path(), "forgotten").unwrap();
        valve.open(&cancel_after(Duration::from_millis(20)));

        let err = ByteSink::write(&valve, b"x").await.unwrap_err();
        assert!(matches!(
            ValveError::from_io(&err),
            Some(ValveError::ValveCancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_stdin_rendezvous() {
        let dir = TempDir::new().unwrap();
        let valve = InValve::create(dir.path(), STDIN).unwrap();
        let shutdown = CancellationToken::new();
        valve.open(&shutdown);

        let mut stdin = valve.open_stdin(&shutdown).await.unwrap();
        ByteSink::write(&valve, b"hello").await.unwrap();
        valve.close();

        let text = tokio::task::spawn_blocking(move || {
            let mut text = String::new();
            stdin.read_to_string(&mut text).unwrap();
            text
        })
        .await
        .unwrap();
        assert_eq!(text, "hello");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stdout_relays_to_destination() {
        let dir = TempDir::new().unwrap();
        let valve = OutValve::create(dir.path(), STDOUT, "/p/proc[stdout]").unwrap();
        let shutdown = CancellationToken::new();
        valve.open(&shutdown);
        let mut stdout = valve.open_stdout(&shutdown).await.unwrap();

        let sink = Arc::new(BufferSink::new());
        valve.send_to(sink.clone());
        stdout.write_all(b"y\ny\n").unwrap();
        drop(stdout);

        let relayed = tokio::time::timeout(Duration::from_secs(5), valve.relay(&shutdown))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relayed, 4);
        assert_eq!(sink.contents_string(), "y\ny\n");
        assert!(sink.is_closed());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_finish_without_peer_reads_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let valve = OutValve::create(dir.path(), "unused", "/p/proc[unused]").unwrap();
        let shutdown = CancellationToken::new();
        valve.open(&shutdown);
        tokio::time::sleep(Duration::from_millis(20)).await;

        valve.finish();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), valve.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_finish_without_destination_detaches() {
        let dir = TempDir::new().unwrap();
        let valve = OutValve::create(dir.path(), STDOUT, "/p/proc[stdout]").unwrap();
        let shutdown = CancellationToken::new();
        valve.open(&shutdown);
        valve.finish();

        let err = tokio::time::timeout(Duration::from_secs(5), valve.relay(&shutdown))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Detached { .. }));
        shutdown.cancel();
    }

    #[test]
    fn test_create_reuses_existing_fifo() {
        let dir = TempDir::new().unwrap();
        InValve::create(dir.path(), "again").unwrap();
        InValve::create(dir.path(), "again").unwrap();
        std::fs::write(dir.path().join("plain"), "").unwrap();
        assert!(matches!(
            InValve::create(dir.path(), "plain"),
            Err(ValveError::CreateFifo { .. })
        ));
    }
}
