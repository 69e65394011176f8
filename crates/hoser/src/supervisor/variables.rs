//! Pipeline variables: spouts feed data in, sinks collect data out.

use std::any::Any;
use std::io;

use async_trait::async_trait;
use hoser_core::{Service, TaskError, TaskOutput, TaskResult};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connector::Connector;
use super::endpoint::{ByteSink, SinkRef, SourceRef};
use crate::error::ConnectorError;

/// A named data source with its own connector.
pub struct Spout {
    name: String,
    connector: Connector,
}

impl Spout {
    pub fn new(name: impl Into<String>, source: SourceRef) -> Self {
        let name = name.into();
        Self {
            connector: Connector::with_source(name.clone(), source),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the data source.
    pub fn update(&self, source: SourceRef) {
        self.connector.read_from(source);
    }

    pub fn send_to(&self, destination: SinkRef) {
        self.connector.send_to(destination);
    }
}

#[async_trait]
impl Service for Spout {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn serve(&self, shutdown: CancellationToken) -> TaskResult {
        match self.connector.serve(&shutdown).await {
            Ok(bytes) => Ok(TaskOutput::with_message(format!("relayed {bytes} bytes"))),
            Err(ConnectorError::ConnectorCancelled { .. }) => Err(TaskError::Cancelled),
            Err(e) => Err(TaskError::failed(e)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A named data destination that can be waited on until it is closed.
pub struct Sink {
    name: String,
    destination: RwLock<SinkRef>,
    closed: watch::Sender<bool>,
}

impl Sink {
    pub fn new(name: impl Into<String>, destination: SinkRef) -> Self {
        Self {
            name: name.into(),
            destination: RwLock::new(destination),
            closed: watch::Sender::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace where written data goes.
    pub fn update(&self, destination: SinkRef) {
        *self.destination.write() = destination;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the sink is closed. Returns false if `shutdown` fired first.
    pub async fn wait_closed(&self, shutdown: &CancellationToken) -> bool {
        let mut rx = self.closed.subscribe();
        matches!(
            shutdown.run_until_cancelled(rx.wait_for(|closed| *closed)).await,
            Some(Ok(_))
        )
    }
}

#[async_trait]
impl ByteSink for Sink {
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let destination = self.destination.read().clone();
        destination.write(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        debug!(sink = %self.name, "Sink closed");
        let destination = self.destination.read().clone();
        destination.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::endpoint::{BufferSink, TextSource};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spout_to_sink() {
        let spout = Spout::new("/p/in", Arc::new(TextSource::new("test string")));
        let out = Arc::new(BufferSink::new());
        let sink = Arc::new(Sink::new("/p/out", out.clone()));
        spout.send_to(sink.clone());

        let result = spout.serve(CancellationToken::new()).await.unwrap();
        assert_eq!(result.message.as_deref(), Some("relayed 11 bytes"));
        assert_eq!(out.contents_string(), "test string");
        assert!(sink.is_closed());
        assert!(out.is_closed());
    }

    #[tokio::test]
    async fn test_spout_cancelled_without_destination() {
        let spout = Spout::new("/p/in", Arc::new(TextSource::new("hello")));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let err = spout.serve(shutdown).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_spout_update_replaces_source() {
        let spout = Spout::new("/p/in", Arc::new(TextSource::new("old")));
        spout.update(Arc::new(TextSource::new("new")));
        let out = Arc::new(BufferSink::new());
        spout.send_to(out.clone());

        spout.serve(CancellationToken::new()).await.unwrap();
        assert_eq!(out.contents_string(), "new");
    }

    #[tokio::test]
    async fn test_sink_update_redirects_writes() {
        let first = Arc::new(BufferSink::new());
        let second = Arc::new(BufferSink::new());
        let sink = Sink::new("/p/out", first.clone());

        sink.write(b"one").await.unwrap();
        sink.update(second.clone());
        sink.write(b"two").await.unwrap();

        assert_eq!(first.contents_string(), "one");
        assert_eq!(second.contents_string(), "two");
    }

    #[tokio::test]
    async fn test_wait_closed() {
        let sink = Arc::new(Sink::new("/p/out", Arc::new(BufferSink::new())));
        let shutdown = CancellationToken::new();

        let waiter = tokio::spawn({
            let sink = sink.clone();
            let shutdown = shutdown.clone();
            async move { sink.wait_closed(&shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_closed_interrupted() {
        let sink = Sink::new("/p/out", Arc::new(BufferSink::new()));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(!sink.wait_closed(&shutdown).await);
    }
}
