//! RTT-over-JTAG transport.
//!
//! Drives the vendor tooling as two child processes: the debug server
//! (`JLinkExe` by default) owns the probe and exposes RTT on a telnet port;
//! the RTT client attaches to that port and relays channel 0 on its stdio.
//! Traces are the client's stdout; commands go to the client's stdin.

use super::{
    PipeReader, PipeWriter, Transport, TransportControl, TransportPair, TransportStream,
};
use crate::process::{ProcessController, DEFAULT_GRACE_MS};
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracelink_types::{ProcessConfig, RttConfig, TraceSource};
use tracing::{debug, info};

// Each transport instance claims its own telnet port so several probes can
// run side by side.
static NEXT_TELNET_PORT: AtomicU32 = AtomicU32::new(30000);

// The server needs a moment to claim the probe before the client attaches.
const SERVER_SETTLE: Duration = Duration::from_millis(500);

/// Transport relaying an RTT channel through the vendor's debug tooling.
pub struct RttTransport {
    config: RttConfig,
    server: Arc<ProcessController>,
    client: Arc<ProcessController>,
    telnet_port: u32,
}

impl RttTransport {
    pub fn new(config: RttConfig) -> Self {
        Self {
            config,
            server: Arc::new(ProcessController::new(DEFAULT_GRACE_MS)),
            client: Arc::new(ProcessController::new(DEFAULT_GRACE_MS)),
            telnet_port: NEXT_TELNET_PORT.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn server_config(&self) -> ProcessConfig {
        let mut argv = vec![
            self.config.server_path.display().to_string(),
            "-device".to_string(),
            self.config.target.clone(),
            "-speed".to_string(),
            self.config.speed_khz.to_string(),
            "-if".to_string(),
            "SWD".to_string(),
            "-autoconnect".to_string(),
            "1".to_string(),
            "-RTTTelnetport".to_string(),
            self.telnet_port.to_string(),
        ];
        if let Some(serial) = &self.config.probe_serial {
            argv.push("-SelectEmuBySn".to_string());
            argv.push(serial.clone());
        }
        ProcessConfig::new(argv)
    }

    fn client_config(&self) -> ProcessConfig {
        ProcessConfig::new(vec![
            self.config.client_path.display().to_string(),
            "-RTTTelnetPort".to_string(),
            self.telnet_port.to_string(),
        ])
    }
}

#[async_trait]
impl Transport for RttTransport {
    async fn open(&mut self) -> Result<TransportPair> {
        info!(
            target: "tracelink::rtt",
            target_device = %self.config.target,
            port = self.telnet_port,
            "starting debug server"
        );
        let server_child = self.server.start(&self.server_config())?;
        // The server's own chatter is not device trace data; it is only
        // drained so the pipe cannot fill up. Its stdin must stay open for
        // the server's lifetime: the vendor tool exits on stdin EOF.
        let server_stdin = server_child.stdin;
        drain_in_background(server_child.stdout, server_child.stderr);

        tokio::time::sleep(SERVER_SETTLE).await;

        debug!(target: "tracelink::rtt", port = self.telnet_port, "attaching RTT client");
        let client_child = self.client.start(&self.client_config())?;

        Ok(TransportPair {
            streams: vec![TransportStream {
                source: TraceSource::Rtt,
                reader: Box::new(PipeReader::new(client_child.stdout)),
            }],
            writer: Some(Box::new(PipeWriter::new(client_child.stdin))),
            exit: None,
            control: Some(Box::new(RttControl {
                server: self.server.clone(),
                client: self.client.clone(),
                _server_stdin: server_stdin,
            })),
        })
    }
}

fn drain_in_background(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
) {
    tokio::spawn(drain(stdout));
    tokio::spawn(drain(stderr));
}

async fn drain<R: tokio::io::AsyncRead + Send + Unpin>(mut reader: R) {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 4096];
    while matches!(reader.read(&mut buf).await, Ok(n) if n > 0) {}
}

struct RttControl {
    server: Arc<ProcessController>,
    client: Arc<ProcessController>,
    _server_stdin: tokio::process::ChildStdin,
}

#[async_trait]
impl TransportControl for RttControl {
    async fn close(&mut self) {
        // Client first so the server is not left with a dangling session.
        self.client.terminate_tree().await;
        self.server.terminate_tree().await;
    }
}
