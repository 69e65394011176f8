//! Byte sources and destinations that connectors move data between.

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Something a connector reads from. `Ok(0)` means end of stream.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Something a connector writes into.
///
/// A write error means the destination no longer accepts data.
#[async_trait]
pub trait ByteSink: Send + Sync {
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Signal end of stream. Closing twice is not an error.
    async fn close(&self) -> io::Result<()>;
}

pub type SourceRef = Arc<dyn ByteSource>;
pub type SinkRef = Arc<dyn ByteSink>;

/// In-memory literal text.
pub struct TextSource {
    data: Vec<u8>,
    offset: Mutex<usize>,
}

impl TextSource {
    pub fn new(text: impl Into<Vec<u8>>) -> Self {
        Self {
            data: text.into(),
            offset: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ByteSource for TextSource {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut offset = self.offset.lock();
        let remaining = &self.data[*offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        *offset += n;
        Ok(n)
    }
}

/// A file opened for reading.
pub struct FileSource {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileSource {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.lock().await.read(buf).await
    }
}

/// A file opened for writing, truncated on open.
pub struct FileSink {
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileSink {
    pub async fn create(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(Some(file)),
        })
    }
}

#[async_trait]
impl ByteSink for FileSink {
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        file.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// Collects everything written into memory. Rejects writes once closed.
#[derive(Default)]
pub struct BufferSink {
    inner: Mutex<BufferState>,
}

#[derive(Default)]
struct BufferState {
    data: Vec<u8>,
    closed: bool,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    pub fn contents_string(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().data).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[async_trait]
impl ByteSink for BufferSink {
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        inner.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_text_source_reads_in_chunks() {
        let source = TextSource::new("hello world");
        let mut buf = [0u8; 5];
        assert_eq!(source.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(source.read(&mut buf).await.unwrap(), 5);
        assert_eq!(source.read(&mut buf).await.unwrap(), 1);
        assert_eq!(source.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_buffer_sink_rejects_after_close() {
        let sink = BufferSink::new();
        sink.write(b"abc").await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(sink.is_closed());
        let err = sink.write(b"d").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(sink.contents_string(), "abc");
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "stale contents that are longer").unwrap();

        let sink = FileSink::create(&path).await.unwrap();
        sink.write(b"fresh").await.unwrap();
        sink.close().await.unwrap();
        assert!(sink.write(b"more").await.is_err());

        let source = FileSource::open(&path).await.unwrap();
        let mut buf = [0u8; 64];
        let n = source.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"fresh");
    }
}
