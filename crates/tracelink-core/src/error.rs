//! Error types for tracelink.

use thiserror::Error;
use tracelink_types::EventTag;

#[derive(Error, Debug)]
pub enum TracelinkError {
    #[error("no event map installed; call set_event_map first")]
    EventMapNotSet,

    #[error("no pattern mapped for event [{0}]")]
    UnknownEventTag(EventTag),

    #[error("duplicate event tag in map: {0}")]
    DuplicateEventTag(EventTag),

    #[error("duplicate pattern in event map: {0}")]
    DuplicatePattern(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("empty argv: nothing to spawn")]
    EmptyCommand,

    #[error("process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport has no write path")]
    NotWritable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
