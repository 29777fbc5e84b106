//! Wait option enums shared between the engine and its callers.

use serde::{Deserialize, Serialize};

/// Which records a wait keeps in its result list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectPattern {
    /// Keep only the most recent matching record.
    LastOnly,
    /// Keep every matching record.
    #[default]
    Matching,
    /// Keep every record seen, matching or not.
    All,
}

/// Shape of the entries in a wait's result list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Plain records; no capture processing.
    #[default]
    Raw,
    /// Match results with named captures and pattern metadata.
    Processed,
}

/// Where a bus subscription starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Only records appended after the subscription was created.
    #[default]
    Live,
    /// Replay the retained backlog first, then live records.
    ReplayAll,
}
