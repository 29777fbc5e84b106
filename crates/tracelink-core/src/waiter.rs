//! The wait state machine.
//!
//! Consumes records from a bus subscription (backlog replay plus live
//! stream) and evaluates the accept/reject predicates until a terminal
//! condition fires: all required patterns satisfied, an avoided pattern
//! seen, deadline expired, cancellation, transport close, or child exit.
//!
//! Avoided patterns are evaluated before required ones for every record;
//! when a record matches both, rejection wins.

use crate::bus::{NextRecord, Subscription};
use crate::events::ResolvedPattern;
use crate::matcher;
use crate::process::ChildExit;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracelink_types::{
    CancelReason, CollectPattern, MatchResult, PendingPattern, ResponseFormat, TerminatedBy,
    TraceRecord, WaitEntry, WaitOutcome,
};
use tracing::{debug, trace};

/// Options controlling one wait.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Deadline in milliseconds. `0` disables the deadline.
    pub timeout_ms: u64,
    /// Which records end up in the result list.
    pub collect: CollectPattern,
    /// Plain records or processed match results.
    pub format: ResponseFormat,
    /// Terminate on the first satisfied required pattern.
    pub return_on_first_match: bool,
    /// Replay the retained backlog before live records. When `false` the
    /// backlog is cleared before the wait subscribes.
    pub use_backlog: bool,
    /// Keep a multi-element result list; `false` retains only the most
    /// recent entry.
    pub accumulate: bool,
    /// Keep consuming until the backing child process exits; success is
    /// then the child's exit status plus any required patterns.
    pub run_to_completion: bool,
    /// Cancellation handle for this wait. Session shutdown cancels every
    /// wait regardless; this token additionally cancels just this one.
    pub cancel: Option<CancellationToken>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            collect: CollectPattern::Matching,
            format: ResponseFormat::Raw,
            return_on_first_match: false,
            use_backlog: true,
            accumulate: true,
            run_to_completion: false,
            cancel: None,
        }
    }
}

impl WaitOptions {
    /// Defaults for `wait_for_trace`: raw text, most recent match only.
    pub fn for_trace() -> Self {
        Self {
            collect: CollectPattern::LastOnly,
            format: ResponseFormat::Raw,
            ..Self::default()
        }
    }

    /// Defaults for `wait_for_event`: processed matches with captures.
    pub fn for_event() -> Self {
        Self {
            collect: CollectPattern::Matching,
            format: ResponseFormat::Processed,
            ..Self::default()
        }
    }
}

/// Drive one wait to a terminal state.
///
/// `required` and `avoided` are snapshots resolved before the wait began;
/// event-map changes made while the wait runs do not affect it. The
/// subscription is consumed and dropped (unsubscribing) on every exit path.
///
/// A wait with no required patterns and no run-to-completion condition is
/// degenerate and returns `Accepted` immediately without consuming records.
pub(crate) async fn run(
    required: Vec<ResolvedPattern>,
    avoided: Vec<ResolvedPattern>,
    options: &WaitOptions,
    mut subscription: Subscription,
    cancel: CancellationToken,
    shutdown: Option<CancellationToken>,
    exit: Option<watch::Receiver<Option<ChildExit>>>,
) -> WaitOutcome {
    // A token that never fires stands in when no shutdown token is wired.
    let shutdown = shutdown.unwrap_or_default();
    let deadline =
        (options.timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(options.timeout_ms));

    if required.is_empty() && !options.run_to_completion {
        debug!(target: "tracelink::waiter", "nothing required, degenerate wait accepted");
        return outcome(true, Vec::new(), &[], TerminatedBy::Accepted);
    }

    let mut remaining = required;
    let mut results: Vec<WaitEntry> = Vec::new();

    loop {
        if subscription.dropped() > 0 {
            debug!(target: "tracelink::waiter", dropped = subscription.dropped(), "mailbox overflow, cancelling wait");
            return outcome(
                false,
                results,
                &remaining,
                TerminatedBy::Cancelled {
                    reason: CancelReason::Overflow,
                },
            );
        }
        // The deadline is re-checked before consuming so a slow consumer
        // cannot stretch the wait past its budget.
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return outcome(false, results, &remaining, TerminatedBy::Timeout);
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => {
                return outcome(
                    false,
                    results,
                    &remaining,
                    TerminatedBy::Cancelled { reason: CancelReason::Requested },
                );
            }
            _ = shutdown.cancelled() => {
                return outcome(
                    false,
                    results,
                    &remaining,
                    TerminatedBy::Cancelled { reason: CancelReason::Shutdown },
                );
            }
            next = subscription.next(deadline) => next,
        };

        let record = match next {
            NextRecord::Timeout => {
                return outcome(false, results, &remaining, TerminatedBy::Timeout)
            }
            NextRecord::Closed => {
                let exited = exit.as_ref().and_then(|rx| *rx.borrow());
                return match exited {
                    Some(exit) => {
                        let successful = remaining.is_empty() && exit.success();
                        outcome(
                            successful,
                            results,
                            &remaining,
                            TerminatedBy::ProcessExited { code: exit.code },
                        )
                    }
                    None => outcome(false, results, &remaining, TerminatedBy::TransportClosed),
                };
            }
            NextRecord::Record(record) => record,
        };
        trace!(target: "tracelink::waiter", seq = record.sequence, "<-- {}", record.text);

        // Rejection is terminal and fail-safe: the offending record is
        // included in the results regardless of the collect pattern.
        if let Some(rejection) = evaluate(&record, &avoided) {
            let pattern = rejection.pattern.clone();
            debug!(target: "tracelink::waiter", pattern = %pattern, "avoided pattern seen: {}", record.text);
            results.extend(entries_for(options.format, &record, vec![rejection]));
            return outcome(false, results, &remaining, TerminatedBy::Rejected { pattern });
        }

        // Each required pattern is satisfied at most once; a record matching
        // several patterns satisfies all of them, in list order.
        let mut matches: Vec<MatchResult> = Vec::new();
        let mut index = 0;
        while index < remaining.len() {
            match evaluate_one(&record, &remaining[index]) {
                Some(found) => {
                    matches.push(found);
                    remaining.remove(index);
                }
                None => index += 1,
            }
        }
        let record_matched = !matches.is_empty();

        match options.collect {
            CollectPattern::Matching => {
                if record_matched {
                    results.extend(entries_for(options.format, &record, matches));
                }
            }
            CollectPattern::All => {
                if record_matched {
                    results.extend(entries_for(options.format, &record, matches));
                } else {
                    results.push(WaitEntry::Record(record.clone()));
                }
            }
            CollectPattern::LastOnly => {
                if record_matched {
                    results = entries_for(options.format, &record, matches);
                }
            }
        }
        if !options.accumulate && results.len() > 1 {
            results.drain(..results.len() - 1);
        }

        if record_matched && options.return_on_first_match {
            return outcome(true, results, &remaining, TerminatedBy::Accepted);
        }
        if remaining.is_empty() && !options.run_to_completion {
            debug!(target: "tracelink::waiter", "all required patterns satisfied");
            return outcome(true, results, &remaining, TerminatedBy::Accepted);
        }
    }
}

fn evaluate(record: &TraceRecord, patterns: &[ResolvedPattern]) -> Option<MatchResult> {
    patterns
        .iter()
        .find_map(|pattern| evaluate_one(record, pattern))
}

fn evaluate_one(record: &TraceRecord, pattern: &ResolvedPattern) -> Option<MatchResult> {
    let mut result = matcher::match_record(record, &pattern.pattern)?;
    result.event = pattern.event.clone();
    Some(result)
}

/// Raw entries are the record itself, once per record no matter how many
/// patterns it satisfied; processed entries carry one match per pattern.
fn entries_for(
    format: ResponseFormat,
    record: &TraceRecord,
    matches: Vec<MatchResult>,
) -> Vec<WaitEntry> {
    match format {
        ResponseFormat::Raw => vec![WaitEntry::Record(record.clone())],
        ResponseFormat::Processed => matches.into_iter().map(WaitEntry::Match).collect(),
    }
}

fn outcome(
    successful: bool,
    results: Vec<WaitEntry>,
    remaining: &[ResolvedPattern],
    terminated_by: TerminatedBy,
) -> WaitOutcome {
    WaitOutcome {
        successful,
        results,
        required_remaining: remaining
            .iter()
            .map(|pattern| PendingPattern {
                pattern: pattern.pattern.as_str().to_string(),
                event: pattern.event.clone(),
            })
            .collect(),
        terminated_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TraceBus;
    use crate::events::EventMap;
    use crate::framer::FramedLine;
    use crate::PatternRef;
    use std::sync::Arc;
    use tracelink_types::{EventTag, StartFrom, TraceSource};

    fn line(text: &str) -> FramedLine {
        FramedLine {
            text: text.to_string(),
            timestamp_ns: 0,
            source: TraceSource::Device,
        }
    }

    fn resolve(patterns: &[&str]) -> Vec<ResolvedPattern> {
        let refs: Vec<PatternRef> = patterns.iter().map(|p| PatternRef::from(*p)).collect();
        EventMap::new().resolve(&refs).unwrap()
    }

    async fn wait_on(
        bus: &Arc<TraceBus>,
        required: &[&str],
        avoided: &[&str],
        options: WaitOptions,
    ) -> WaitOutcome {
        let subscription = bus.subscribe(StartFrom::ReplayAll);
        run(
            resolve(required),
            resolve(avoided),
            &options,
            subscription,
            CancellationToken::new(),
            None,
            None,
        )
        .await
    }

    #[tokio::test]
    async fn accepts_when_all_required_match() {
        let bus = Arc::new(TraceBus::new(64, 64));
        for text in ["foo1", "noise", "bar2"] {
            bus.append(line(text));
        }
        let outcome = wait_on(&bus, &[r"foo\d", r"bar\d"], &[], WaitOptions::default()).await;
        assert!(outcome.successful);
        assert_eq!(outcome.terminated_by, TerminatedBy::Accepted);
        assert_eq!(outcome.texts(), vec!["foo1", "bar2"]);
        assert!(outcome.required_remaining.is_empty());
    }

    #[tokio::test]
    async fn avoided_wins_over_required_on_same_record() {
        let bus = Arc::new(TraceBus::new(64, 64));
        bus.append(line("fatal: boot ok"));
        let outcome = wait_on(&bus, &[r"boot ok"], &[r"fatal"], WaitOptions::default()).await;
        assert!(!outcome.successful);
        assert!(outcome.is_rejected());
        // The offending record is reported even though it also matched.
        assert_eq!(outcome.texts(), vec!["fatal: boot ok"]);
        assert_eq!(outcome.required_remaining.len(), 1);
    }

    #[tokio::test]
    async fn first_match_terminates_early() {
        let bus = Arc::new(TraceBus::new(64, 64));
        for text in ["foo1", "bar2"] {
            bus.append(line(text));
        }
        let options = WaitOptions {
            return_on_first_match: true,
            ..WaitOptions::default()
        };
        let outcome = wait_on(&bus, &[r"foo\d", r"bar\d"], &[], options).await;
        assert!(outcome.successful);
        assert_eq!(outcome.texts(), vec!["foo1"]);
        assert_eq!(outcome.required_remaining[0].pattern, r"bar\d");
    }

    #[tokio::test]
    async fn last_only_keeps_most_recent_match() {
        let bus = Arc::new(TraceBus::new(64, 64));
        for text in ["foo1", "bar2", "baz3"] {
            bus.append(line(text));
        }
        let options = WaitOptions {
            collect: CollectPattern::LastOnly,
            ..WaitOptions::default()
        };
        let outcome = wait_on(&bus, &[r"foo\d", r"bar\d", r"baz\d"], &[], options).await;
        assert!(outcome.successful);
        assert_eq!(outcome.texts(), vec!["baz3"]);
    }

    #[tokio::test]
    async fn collect_all_keeps_non_matching_records() {
        let bus = Arc::new(TraceBus::new(64, 64));
        for text in ["noise", "foo1"] {
            bus.append(line(text));
        }
        let options = WaitOptions {
            collect: CollectPattern::All,
            ..WaitOptions::default()
        };
        let outcome = wait_on(&bus, &[r"foo\d"], &[], options).await;
        assert!(outcome.successful);
        assert_eq!(outcome.texts(), vec!["noise", "foo1"]);
    }

    #[tokio::test]
    async fn one_record_satisfies_multiple_patterns_once() {
        let bus = Arc::new(TraceBus::new(64, 64));
        bus.append(line("status: ready, armed"));
        let options = WaitOptions {
            format: ResponseFormat::Processed,
            ..WaitOptions::default()
        };
        let outcome = wait_on(&bus, &[r"ready", r"armed"], &[], options).await;
        assert!(outcome.successful);
        // One match result per pattern, same record.
        assert_eq!(outcome.matches().len(), 2);
        assert!(outcome.required_remaining.is_empty());
    }

    #[tokio::test]
    async fn raw_format_reports_multi_match_record_once() {
        let bus = Arc::new(TraceBus::new(64, 64));
        bus.append(line("status: ready, armed"));
        let outcome = wait_on(&bus, &[r"ready", r"armed"], &[], WaitOptions::default()).await;
        assert!(outcome.successful);
        assert_eq!(outcome.texts(), vec!["status: ready, armed"]);
    }

    #[tokio::test]
    async fn times_out_with_remaining_patterns() {
        let bus = Arc::new(TraceBus::new(64, 64));
        bus.append(line("foo1"));
        let options = WaitOptions {
            timeout_ms: 100,
            ..WaitOptions::default()
        };
        let started = std::time::Instant::now();
        let outcome = wait_on(&bus, &[r"foo\d", r"never"], &[], options).await;
        assert!(!outcome.successful);
        assert!(outcome.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(outcome.required_remaining.len(), 1);
        assert_eq!(outcome.required_remaining[0].pattern, "never");
        assert_eq!(outcome.texts(), vec!["foo1"]);
    }

    #[tokio::test]
    async fn empty_required_accepts_immediately() {
        let bus = Arc::new(TraceBus::new(64, 64));
        let started = std::time::Instant::now();
        let outcome = wait_on(&bus, &[], &[], WaitOptions::default()).await;
        assert!(outcome.successful);
        assert_eq!(outcome.terminated_by, TerminatedBy::Accepted);
        assert!(outcome.results.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn transport_close_terminates_wait() {
        let bus = Arc::new(TraceBus::new(64, 64));
        let subscription = bus.subscribe(StartFrom::Live);
        let appender = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.append(line("partial"));
                bus.close();
            })
        };
        let outcome = run(
            resolve(&[r"never"]),
            Vec::new(),
            &WaitOptions {
                timeout_ms: 5_000,
                ..WaitOptions::default()
            },
            subscription,
            CancellationToken::new(),
            None,
            None,
        )
        .await;
        appender.await.unwrap();
        assert!(!outcome.successful);
        assert_eq!(outcome.terminated_by, TerminatedBy::TransportClosed);
    }

    #[tokio::test]
    async fn cancellation_unblocks_wait() {
        let bus = Arc::new(TraceBus::new(64, 64));
        let subscription = bus.subscribe(StartFrom::Live);
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        let outcome = run(
            resolve(&[r"never"]),
            Vec::new(),
            &WaitOptions {
                timeout_ms: 0,
                ..WaitOptions::default()
            },
            subscription,
            cancel,
            None,
            None,
        )
        .await;
        canceller.await.unwrap();
        assert_eq!(
            outcome.terminated_by,
            TerminatedBy::Cancelled {
                reason: CancelReason::Requested
            }
        );
    }

    #[tokio::test]
    async fn mailbox_overflow_surfaces_as_cancelled() {
        let bus = Arc::new(TraceBus::new(256, 2));
        let subscription = bus.subscribe(StartFrom::Live);
        // Fill well past the mailbox without the waiter running yet.
        for i in 0..8 {
            bus.append(line(&format!("t{}", i)));
        }
        let outcome = run(
            resolve(&[r"never"]),
            Vec::new(),
            &WaitOptions::default(),
            subscription,
            CancellationToken::new(),
            None,
            None,
        )
        .await;
        assert_eq!(
            outcome.terminated_by,
            TerminatedBy::Cancelled {
                reason: CancelReason::Overflow
            }
        );
    }

    #[tokio::test]
    async fn processed_event_wait_carries_tag_and_captures() {
        let map = EventMap::new();
        map.set([(EventTag::from("version"), r"VERSION:(?P<major>\d+)")])
            .unwrap();
        let resolved = map
            .resolve(&[PatternRef::Tagged(EventTag::from("version"))])
            .unwrap();

        let bus = Arc::new(TraceBus::new(64, 64));
        bus.append(line("VERSION:4"));
        let outcome = run(
            resolved,
            Vec::new(),
            &WaitOptions::for_event(),
            bus.subscribe(StartFrom::ReplayAll),
            CancellationToken::new(),
            None,
            None,
        )
        .await;
        assert!(outcome.successful);
        let matches = outcome.matches();
        assert_eq!(matches[0].event, Some(EventTag::from("version")));
        assert_eq!(matches[0].named_captures["major"], "4");
    }

    #[tokio::test]
    async fn run_to_completion_reports_exit_code() {
        let bus = Arc::new(TraceBus::new(64, 64));
        let (exit_tx, exit_rx) = watch::channel(None);
        let subscription = bus.subscribe(StartFrom::Live);
        let driver = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.append(line("done"));
                exit_tx.send(Some(ChildExit { code: Some(0) })).unwrap();
                bus.close();
            })
        };
        let outcome = run(
            resolve(&[r"done"]),
            Vec::new(),
            &WaitOptions {
                run_to_completion: true,
                ..WaitOptions::default()
            },
            subscription,
            CancellationToken::new(),
            None,
            Some(exit_rx),
        )
        .await;
        driver.await.unwrap();
        assert!(outcome.successful);
        assert_eq!(
            outcome.terminated_by,
            TerminatedBy::ProcessExited { code: Some(0) }
        );
    }
}
