//! Spawned-process transport: stdout and stderr as trace streams, stdin as
//! the command write path.

use super::{
    PipeReader, PipeWriter, Transport, TransportControl, TransportPair, TransportStream,
};
use crate::process::{ProcessController, DEFAULT_GRACE_MS};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracelink_types::{ProcessConfig, TraceSource};

/// Transport backed by a child process in its own process group.
pub struct ProcessTransport {
    config: ProcessConfig,
    controller: Arc<ProcessController>,
}

impl ProcessTransport {
    pub fn new(config: ProcessConfig) -> Self {
        Self::with_grace(config, DEFAULT_GRACE_MS)
    }

    pub fn with_grace(config: ProcessConfig, grace_ms: u64) -> Self {
        Self {
            config,
            controller: Arc::new(ProcessController::new(grace_ms)),
        }
    }

    /// Controller handle, for callers that need to terminate the tree out
    /// of band.
    pub fn controller(&self) -> Arc<ProcessController> {
        self.controller.clone()
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn open(&mut self) -> Result<TransportPair> {
        let child = self.controller.start(&self.config)?;
        Ok(TransportPair {
            streams: vec![
                TransportStream {
                    source: TraceSource::Stdout,
                    reader: Box::new(PipeReader::new(child.stdout)),
                },
                TransportStream {
                    source: TraceSource::Stderr,
                    reader: Box::new(PipeReader::new(child.stderr)),
                },
            ],
            writer: Some(Box::new(PipeWriter::new(child.stdin))),
            exit: Some(self.controller.exit_watch()),
            control: Some(Box::new(ProcessControl(self.controller.clone()))),
        })
    }
}

struct ProcessControl(Arc<ProcessController>);

#[async_trait]
impl TransportControl for ProcessControl {
    async fn close(&mut self) {
        self.0.terminate_tree().await;
    }
}
