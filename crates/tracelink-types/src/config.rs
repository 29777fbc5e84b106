//! Transport configuration structs.
//!
//! These are plain serde types so embedders can load them from TOML or JSON.
//! Only the process, RTT, and WebSocket transports have in-tree drivers;
//! `SerialConfig` documents the contract for an externally supplied driver.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Serial parity setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Configuration for a serial-port device channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (`/dev/ttyUSB0`) or COM port name.
    pub path: PathBuf,
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
}

/// Configuration for an RTT channel behind a JTAG/SWD probe.
///
/// The driver runs the vendor's debug server and RTT client as child
/// processes; traces are the client's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RttConfig {
    /// Target device name as the probe software knows it (e.g. `NRF52832_XXAA`).
    pub target: String,
    #[serde(default = "default_speed_khz")]
    pub speed_khz: u32,
    #[serde(default)]
    pub rtt_channel: u8,
    /// Debug-server binary (e.g. `JLinkExe`) driven as a child process.
    #[serde(default = "default_rtt_server")]
    pub server_path: PathBuf,
    /// RTT client binary driven as a child process.
    #[serde(default = "default_rtt_client")]
    pub client_path: PathBuf,
    /// Probe serial number, when more than one probe is attached.
    #[serde(default)]
    pub probe_serial: Option<String>,
}

/// Configuration for a WebSocket device channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    pub url: String,
    #[serde(default)]
    pub subprotocols: Vec<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// Configuration for a spawned-process channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Program and arguments. Must be non-empty.
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl ProcessConfig {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Run a shell command line through `/bin/sh -c`.
    pub fn shell(cmd: impl Into<String>) -> Self {
        Self::new(vec!["/bin/sh".to_string(), "-c".to_string(), cmd.into()])
    }
}

fn default_stop_bits() -> u8 {
    1
}

fn default_data_bits() -> u8 {
    8
}

fn default_line_terminator() -> String {
    "\n".to_string()
}

fn default_speed_khz() -> u32 {
    4000
}

fn default_rtt_server() -> PathBuf {
    PathBuf::from("JLinkExe")
}

fn default_rtt_client() -> PathBuf {
    PathBuf::from("JLinkRTTClient")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_config_wraps_command() {
        let config = ProcessConfig::shell("echo hello");
        assert_eq!(config.argv, vec!["/bin/sh", "-c", "echo hello"]);
        assert!(config.cwd.is_none());
    }
}
