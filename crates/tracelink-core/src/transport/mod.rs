//! Transport adapter contract and the in-tree drivers.
//!
//! A transport opens into one or more read streams (one per source tag), an
//! optional serialized write path, an optional child-exit watch for
//! process-backed channels, and a control handle used to tear the channel
//! down. Read deadlines are applied by the caller; `read_chunk` itself
//! blocks until data, EOF, or error.
//!
//! In-tree drivers: spawned-process pipes, RTT via the vendor's debug
//! server + RTT client child processes, and WebSocket. Serial is config +
//! contract only; a driver plugs in by implementing these traits.

mod process;
mod rtt;
mod ws;

pub use process::ProcessTransport;
pub use rtt::RttTransport;
pub use ws::WebSocketTransport;

use crate::process::ChildExit;
use crate::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracelink_types::TraceSource;

/// Read side of one transport stream. Single consumer.
#[async_trait]
pub trait TransportReader: Send {
    /// Next chunk of bytes. `Ok(None)` when the peer closed.
    async fn read_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>>;
}

/// Write side of a transport. Callers serialize access.
#[async_trait]
pub trait TransportWriter: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()>;

    async fn shutdown(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Teardown handle for an opened transport.
#[async_trait]
pub trait TransportControl: Send {
    async fn close(&mut self);
}

/// One read stream with its source tag.
pub struct TransportStream {
    pub source: TraceSource,
    pub reader: Box<dyn TransportReader>,
}

/// Everything an opened transport hands to the session.
pub struct TransportPair {
    pub streams: Vec<TransportStream>,
    pub writer: Option<Box<dyn TransportWriter>>,
    /// Present for process-backed channels: resolves once the child is
    /// reaped.
    pub exit: Option<watch::Receiver<Option<ChildExit>>>,
    pub control: Option<Box<dyn TransportControl>>,
}

/// A byte-duplex channel the session can capture from.
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> Result<TransportPair>;
}

/// `TransportReader` over any async byte pipe.
pub struct PipeReader<R> {
    inner: R,
    buf: [u8; 4096],
}

impl<R> PipeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: [0; 4096],
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> TransportReader for PipeReader<R> {
    async fn read_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match self.inner.read(&mut self.buf).await? {
            0 => Ok(None),
            n => Ok(Some(self.buf[..n].to_vec())),
        }
    }
}

/// `TransportWriter` over any async byte pipe.
pub struct PipeWriter<W> {
    inner: W,
}

impl<W> PipeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> TransportWriter for PipeWriter<W> {
    async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}
