//! Trace records and their source tags.

use serde::{Deserialize, Serialize};

/// Which stream a trace record was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceSource {
    /// Child process standard output.
    Stdout,
    /// Child process standard error.
    Stderr,
    /// Generic device channel (e.g. serial).
    Device,
    /// RTT channel over a JTAG/SWD debug probe.
    Rtt,
    /// WebSocket channel.
    Ws,
}

impl TraceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceSource::Stdout => "stdout",
            TraceSource::Stderr => "stderr",
            TraceSource::Device => "device",
            TraceSource::Rtt => "rtt",
            TraceSource::Ws => "ws",
        }
    }
}

impl std::fmt::Display for TraceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One framed line observed from a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// The decoded line, trailing terminators stripped.
    pub text: String,
    /// Monotonic nanoseconds (session epoch) at framing time.
    pub timestamp_ns: u64,
    /// Stream the line was observed on.
    pub source: TraceSource,
    /// Strictly increasing, gap-free per session. Assigned by the bus.
    pub sequence: u64,
}
