//! Stateless record-against-pattern evaluation.

use crate::events::CompiledPattern;
use std::collections::HashMap;
use tracelink_types::{MatchResult, TraceRecord};

/// Evaluate a compiled pattern against a record with an unanchored search.
/// Named capture groups are copied into the result. Pure and reentrant.
pub fn match_record(record: &TraceRecord, pattern: &CompiledPattern) -> Option<MatchResult> {
    let captures = pattern.regex().captures(&record.text)?;
    let mut named_captures = HashMap::new();
    for name in pattern.capture_names() {
        if let Some(group) = captures.name(name) {
            named_captures.insert(name.clone(), group.as_str().to_string());
        }
    }
    Some(MatchResult {
        record: record.clone(),
        pattern: pattern.as_str().to_string(),
        named_captures,
        event: None,
    })
}
