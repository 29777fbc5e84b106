//! Wait outcomes and match results.

use crate::{EventTag, TraceRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A pattern match against one trace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    /// The record that matched.
    pub record: TraceRecord,
    /// Source text of the pattern that matched.
    pub pattern: String,
    /// Named capture groups extracted from the record text.
    pub named_captures: HashMap<String, String>,
    /// Event tag the pattern was resolved from, for event waits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventTag>,
}

/// One entry of a wait's result list.
///
/// Raw waits collect plain records; processed waits collect match results
/// carrying named captures and pattern metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitEntry {
    Record(TraceRecord),
    Match(MatchResult),
}

impl WaitEntry {
    /// Text of the underlying record.
    pub fn text(&self) -> &str {
        match self {
            WaitEntry::Record(record) => &record.text,
            WaitEntry::Match(result) => &result.record.text,
        }
    }

    pub fn record(&self) -> &TraceRecord {
        match self {
            WaitEntry::Record(record) => record,
            WaitEntry::Match(result) => &result.record,
        }
    }

    pub fn as_match(&self) -> Option<&MatchResult> {
        match self {
            WaitEntry::Match(result) => Some(result),
            WaitEntry::Record(_) => None,
        }
    }
}

/// A required pattern that has not matched yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPattern {
    /// Source text of the pattern.
    pub pattern: String,
    /// Event tag the pattern was resolved from, for event waits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventTag>,
}

/// Why a wait was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit cancellation through the wait's handle.
    Requested,
    /// The wait's mailbox dropped records; results would be unreliable.
    Overflow,
    /// The owning session shut down.
    Shutdown,
}

/// Terminal condition of a wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatedBy {
    /// All required patterns satisfied (or first match, when requested).
    Accepted,
    /// An avoided pattern matched.
    Rejected { pattern: String },
    /// The deadline expired with required patterns outstanding.
    Timeout,
    /// The wait was cancelled before any other terminal condition.
    Cancelled { reason: CancelReason },
    /// The transport closed mid-wait.
    TransportClosed,
    /// The backing child process exited (run-to-completion waits).
    /// `code` is `None` when the child was killed by a signal.
    ProcessExited { code: Option<i32> },
}

/// Result of a wait operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitOutcome {
    /// Whether the acceptance condition was met.
    pub successful: bool,
    /// Collected records / matches, per the wait's collect pattern.
    pub results: Vec<WaitEntry>,
    /// Required patterns that never matched.
    pub required_remaining: Vec<PendingPattern>,
    /// What ended the wait.
    pub terminated_by: TerminatedBy,
}

impl WaitOutcome {
    /// Record texts of every collected entry, in collection order.
    pub fn texts(&self) -> Vec<&str> {
        self.results.iter().map(WaitEntry::text).collect()
    }

    /// Collected match results only.
    pub fn matches(&self) -> Vec<&MatchResult> {
        self.results.iter().filter_map(WaitEntry::as_match).collect()
    }

    /// Event tags of required patterns that never matched.
    pub fn remaining_events(&self) -> Vec<&EventTag> {
        self.required_remaining
            .iter()
            .filter_map(|p| p.event.as_ref())
            .collect()
    }

    pub fn is_timeout(&self) -> bool {
        self.terminated_by == TerminatedBy::Timeout
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.terminated_by, TerminatedBy::Rejected { .. })
    }
}
