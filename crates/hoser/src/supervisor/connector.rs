//! Connectors relay bytes from one source to one destination.
//!
//! Either endpoint may be bound, replaced or missing at any time. While an
//! endpoint is missing the relay waits; binding one wakes it. A destination
//! that fails a write is detached and the relay waits for a replacement,
//! dropping the chunk it could not deliver.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hoser_core::emit;
use hoser_core::metrics::events::BytesRelayed;
use parking_lot::Mutex;
use snafu::prelude::*;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::endpoint::{SinkRef, SourceRef};
use crate::error::{
    ConnectorCancelledSnafu, ConnectorError, DetachedSnafu, ShortWriteSnafu, SourceReadSnafu,
};

/// Size of each read from the source.
pub const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Default)]
struct Endpoints {
    source: Option<SourceRef>,
    destination: Option<SinkRef>,
}

pub struct Connector {
    name: String,
    endpoints: Mutex<Endpoints>,
    // Holds at most one pending wake, so rebinding while the relay is busy
    // never queues up more than one extra check.
    wake: Notify,
    draining: AtomicBool,
    bytes_written: AtomicU64,
}

impl Connector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoints: Mutex::new(Endpoints::default()),
            wake: Notify::new(),
            draining: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn with_source(name: impl Into<String>, source: SourceRef) -> Self {
        let connector = Self::new(name);
        connector.endpoints.lock().source = Some(source);
        connector
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind (or replace) the source.
    pub fn read_from(&self, source: SourceRef) {
        self.endpoints.lock().source = Some(source);
        self.wake.notify_one();
    }

    /// Bind (or replace) the destination.
    pub fn send_to(&self, destination: SinkRef) {
        self.endpoints.lock().destination = Some(destination);
        self.wake.notify_one();
    }

    pub fn has_destination(&self) -> bool {
        self.endpoints.lock().destination.is_some()
    }

    /// Total bytes delivered to destinations so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Ask the relay to finish the current stream but not to wait for a
    /// missing endpoint. A relay that would otherwise block on binding
    /// returns `Detached` instead.
    pub fn close_when_idle(&self) {
        self.draining.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Clear a previous `close_when_idle` so the connector can relay again.
    pub fn rearm(&self) {
        self.draining.store(false, Ordering::Release);
    }

    /// Relay until the source reaches end of stream, then close the
    /// destination and return the number of bytes relayed by this call.
    pub async fn serve(&self, shutdown: &CancellationToken) -> Result<u64, ConnectorError> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut relayed = 0u64;

        loop {
            let (source, destination) = self.wait_for_endpoints(shutdown).await?;

            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                read = source.read(&mut buf) => Some(read),
            };
            let n = match read {
                None => return ConnectorCancelledSnafu { name: &self.name }.fail(),
                Some(read) => read.context(SourceReadSnafu { name: &self.name })?,
            };

            if n == 0 {
                debug!(connector = %self.name, relayed, "Source reached end of stream");
                if let Err(e) = destination.close().await {
                    warn!(connector = %self.name, error = %e, "Failed to close destination");
                }
                return Ok(relayed);
            }

            let written = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                written = destination.write(&buf[..n]) => Some(written),
            };
            match written {
                None => return ConnectorCancelledSnafu { name: &self.name }.fail(),
                Some(Ok(written)) if written == n => {
                    relayed += n as u64;
                    self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                    emit!(BytesRelayed {
                        connector: self.name.clone(),
                        bytes: n as u64,
                    });
                }
                Some(Ok(written)) => {
                    return ShortWriteSnafu {
                        name: &self.name,
                        expected: n,
                        written,
                    }
                    .fail();
                }
                Some(Err(e)) => {
                    debug!(connector = %self.name, error = %e, dropped = n, "Destination rejected write, detaching");
                    self.detach_destination(&destination);
                }
            }
        }
    }

    async fn wait_for_endpoints(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<(SourceRef, SinkRef), ConnectorError> {
        loop {
            {
                let endpoints = self.endpoints.lock();
                match (&endpoints.source, &endpoints.destination) {
                    (Some(source), Some(destination)) => {
                        return Ok((source.clone(), destination.clone()));
                    }
                    (source, _) if self.draining.load(Ordering::Acquire) => {
                        let missing = if source.is_none() { "source" } else { "destination" };
                        return DetachedSnafu {
                            name: &self.name,
                            missing,
                        }
                        .fail();
                    }
                    _ => {}
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return ConnectorCancelledSnafu { name: &self.name }.fail();
                }
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Unbind `destination` unless it has already been replaced.
    fn detach_destination(&self, destination: &SinkRef) {
        let mut endpoints = self.endpoints.lock();
        if endpoints
            .destination
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, destination))
        {
            endpoints.destination = None;
        }
    }
}
