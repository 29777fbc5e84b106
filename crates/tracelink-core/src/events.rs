//! Event map and pattern resolution.
//!
//! The map from event tags to compiled patterns is copy-on-write: `set`
//! swaps the whole map atomically and in-flight waits keep the snapshot they
//! resolved against.

use crate::{Result, TracelinkError};
use regex::{Regex, RegexBuilder};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracelink_types::EventTag;
use tracing::debug;

/// A regex plus the named capture groups it exposes.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    regex: Regex,
    capture_names: Vec<String>,
}

impl CompiledPattern {
    /// Compile a raw pattern string. Raw patterns match case-insensitively,
    /// matching the behavior device CLIs and bootloaders are tested against.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self::from_regex(regex))
    }

    /// Wrap an already compiled regex, used exactly as given.
    pub fn from_regex(regex: Regex) -> Self {
        let capture_names = regex
            .capture_names()
            .flatten()
            .map(String::from)
            .collect();
        Self {
            regex,
            capture_names,
        }
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Named capture groups, in definition order.
    pub fn capture_names(&self) -> &[String] {
        &self.capture_names
    }
}

/// A pattern argument to a wait: raw text, a compiled regex, or an event tag
/// resolved through the session's event map.
#[derive(Debug, Clone)]
pub enum PatternRef {
    Raw(String),
    Compiled(Regex),
    Tagged(EventTag),
}

impl From<&str> for PatternRef {
    fn from(pattern: &str) -> Self {
        PatternRef::Raw(pattern.to_string())
    }
}

impl From<String> for PatternRef {
    fn from(pattern: String) -> Self {
        PatternRef::Raw(pattern)
    }
}

impl From<Regex> for PatternRef {
    fn from(regex: Regex) -> Self {
        PatternRef::Compiled(regex)
    }
}

impl From<EventTag> for PatternRef {
    fn from(tag: EventTag) -> Self {
        PatternRef::Tagged(tag)
    }
}

/// A pattern after resolution against an event-map snapshot.
#[derive(Debug, Clone)]
pub struct ResolvedPattern {
    pub pattern: Arc<CompiledPattern>,
    pub event: Option<EventTag>,
}

type MapSnapshot = Arc<HashMap<EventTag, Arc<CompiledPattern>>>;

/// Compiled registry from event tag to pattern.
#[derive(Default)]
pub struct EventMap {
    inner: RwLock<Option<MapSnapshot>>,
}

impl EventMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active map atomically. Rejects duplicate tags and
    /// duplicate pattern strings; the map must stay invertible so remaining
    /// patterns can be reported as events.
    pub fn set<I, S>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (EventTag, S)>,
        S: AsRef<str>,
    {
        let mut map = HashMap::new();
        let mut patterns_seen = HashSet::new();
        for (tag, pattern) in entries {
            let pattern = pattern.as_ref();
            if !patterns_seen.insert(pattern.to_string()) {
                return Err(TracelinkError::DuplicatePattern(pattern.to_string()));
            }
            let compiled = Arc::new(CompiledPattern::new(pattern)?);
            if map.insert(tag.clone(), compiled).is_some() {
                return Err(TracelinkError::DuplicateEventTag(tag));
            }
        }
        debug!(target: "tracelink::events", entries = map.len(), "event map replaced");
        *self.inner.write().expect("event map lock poisoned") = Some(Arc::new(map));
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.inner
            .read()
            .expect("event map lock poisoned")
            .is_some()
    }

    /// Current snapshot; later `set` calls do not affect it.
    pub fn snapshot(&self) -> Option<MapSnapshot> {
        self.inner
            .read()
            .expect("event map lock poisoned")
            .clone()
    }

    /// Resolve a list of pattern refs against the current snapshot.
    ///
    /// Duplicate patterns collapse to one entry: each pattern is satisfied
    /// at most once per wait. Unknown tags fail before any I/O happens.
    pub fn resolve(&self, refs: &[PatternRef]) -> Result<Vec<ResolvedPattern>> {
        let snapshot = self.snapshot();
        let mut resolved: Vec<ResolvedPattern> = Vec::with_capacity(refs.len());
        for pattern_ref in refs {
            let entry = match pattern_ref {
                PatternRef::Raw(pattern) => ResolvedPattern {
                    pattern: Arc::new(CompiledPattern::new(pattern)?),
                    event: None,
                },
                PatternRef::Compiled(regex) => ResolvedPattern {
                    pattern: Arc::new(CompiledPattern::from_regex(regex.clone())),
                    event: None,
                },
                PatternRef::Tagged(tag) => {
                    let map = snapshot.as_ref().ok_or(TracelinkError::EventMapNotSet)?;
                    let compiled = map
                        .get(tag)
                        .ok_or_else(|| TracelinkError::UnknownEventTag(tag.clone()))?;
                    ResolvedPattern {
                        pattern: compiled.clone(),
                        event: Some(tag.clone()),
                    }
                }
            };
            if resolved
                .iter()
                .all(|existing| existing.pattern.as_str() != entry.pattern.as_str())
            {
                resolved.push(entry);
            }
        }
        Ok(resolved)
    }
}
