//! Thread-safe trace bus: bounded backlog plus live broadcast.
//!
//! Every appended record lands in the backlog before any subscriber observes
//! it, so a later backlog replay can never run ahead of the live stream.
//! Sequences are assigned at append time and are gap-free and strictly
//! increasing for the lifetime of the owning session, across capture
//! restarts.

use crate::framer::FramedLine;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracelink_types::{StartFrom, TraceRecord};
use tracing::{debug, trace, warn};

/// Default number of records retained in the backlog.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 4096;
/// Default per-subscriber mailbox depth.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<TraceRecord>,
    dropped: Arc<AtomicU64>,
}

struct BusState {
    backlog: VecDeque<TraceRecord>,
    subscribers: Vec<SubscriberSlot>,
    next_sequence: u64,
    next_subscriber_id: u64,
    evicted: u64,
    closed: bool,
}

/// Bounded queue of trace records with live broadcast to subscribers.
pub struct TraceBus {
    state: Mutex<BusState>,
    backlog_capacity: usize,
    mailbox_capacity: usize,
}

impl TraceBus {
    pub fn new(backlog_capacity: usize, mailbox_capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState {
                backlog: VecDeque::with_capacity(backlog_capacity.min(1024)),
                subscribers: Vec::new(),
                next_sequence: 0,
                next_subscriber_id: 0,
                evicted: 0,
                closed: false,
            }),
            backlog_capacity,
            mailbox_capacity,
        }
    }

    /// Assign a sequence, retain in the backlog (evicting the oldest record
    /// if at capacity), then broadcast to live subscribers. A subscriber
    /// whose mailbox is full loses the new record for itself only; its
    /// private drop counter is bumped so the waiter can refuse to report a
    /// false positive.
    ///
    /// Returns the assigned sequence, or `None` when the bus is closed.
    pub fn append(&self, line: FramedLine) -> Option<u64> {
        let mut state = self.state.lock().expect("bus lock poisoned");
        if state.closed {
            warn!(target: "tracelink::bus", "record dropped after close: {}", line.text);
            return None;
        }

        let record = TraceRecord {
            text: line.text,
            timestamp_ns: line.timestamp_ns,
            source: line.source,
            sequence: state.next_sequence,
        };
        state.next_sequence += 1;

        if state.backlog.len() >= self.backlog_capacity {
            state.backlog.pop_front();
            state.evicted += 1;
        }
        state.backlog.push_back(record.clone());

        state.subscribers.retain(|slot| {
            match slot.tx.try_send(record.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(target: "tracelink::bus", subscriber = slot.id, "mailbox full, record dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        Some(record.sequence)
    }

    /// Create a cursor over the bus. `ReplayAll` materializes the current
    /// backlog into the cursor before the mailbox is registered, both under
    /// one lock, so the replay and the live stream neither miss nor
    /// duplicate a sequence.
    pub fn subscribe(self: &Arc<Self>, start_from: StartFrom) -> Subscription {
        let mut state = self.state.lock().expect("bus lock poisoned");

        let replay = match start_from {
            StartFrom::ReplayAll => state.backlog.iter().cloned().collect(),
            StartFrom::Live => VecDeque::new(),
        };

        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;

        if state.closed {
            // Terminal bus: the subscription sees the replay, then Closed.
            drop(tx);
        } else {
            state.subscribers.push(SubscriberSlot {
                id,
                tx,
                dropped: dropped.clone(),
            });
        }

        debug!(target: "tracelink::bus", subscriber = id, ?start_from, "subscribed");
        Subscription {
            bus: Arc::clone(self),
            id,
            replay,
            rx,
            dropped,
            last_sequence: None,
        }
    }

    /// Empty the backlog. Replays already materialized into a subscription's
    /// cursor are unaffected.
    pub fn clear_backlog(&self) {
        let mut state = self.state.lock().expect("bus lock poisoned");
        state.backlog.clear();
    }

    /// Close the bus. Live subscribers drain their mailboxes and then
    /// observe `Closed`. Terminal for external holders; the owning session
    /// may re-arm the bus on a capture restart, preserving the sequence
    /// counter.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("bus lock poisoned");
        if !state.closed {
            state.closed = true;
            state.subscribers.clear();
            debug!(target: "tracelink::bus", "bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("bus lock poisoned").closed
    }

    /// Records evicted from the backlog by the capacity bound.
    pub fn evicted(&self) -> u64 {
        self.state.lock().expect("bus lock poisoned").evicted
    }

    /// Number of records currently retained.
    pub fn backlog_len(&self) -> usize {
        self.state.lock().expect("bus lock poisoned").backlog.len()
    }

    pub(crate) fn reopen(&self) {
        let mut state = self.state.lock().expect("bus lock poisoned");
        state.closed = false;
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock().expect("bus lock poisoned");
        state.subscribers.retain(|slot| slot.id != id);
    }
}

/// Result of [`Subscription::next`].
#[derive(Debug)]
pub enum NextRecord {
    Record(TraceRecord),
    Timeout,
    Closed,
}

/// A live cursor over the bus, optionally preceded by a backlog replay.
///
/// Unsubscribes on drop, on every exit path.
pub struct Subscription {
    bus: Arc<TraceBus>,
    id: u64,
    replay: VecDeque<TraceRecord>,
    rx: mpsc::Receiver<TraceRecord>,
    dropped: Arc<AtomicU64>,
    last_sequence: Option<u64>,
}

impl Subscription {
    /// Next record, replay first, deduped by sequence. Blocks until a record
    /// arrives, the deadline passes, or the bus closes.
    pub async fn next(&mut self, deadline: Option<Instant>) -> NextRecord {
        while let Some(record) = self.replay.pop_front() {
            if self.already_seen(record.sequence) {
                continue;
            }
            self.last_sequence = Some(record.sequence);
            return NextRecord::Record(record);
        }

        loop {
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => return NextRecord::Timeout,
                },
                None => self.rx.recv().await,
            };
            match received {
                None => return NextRecord::Closed,
                Some(record) if self.already_seen(record.sequence) => continue,
                Some(record) => {
                    self.last_sequence = Some(record.sequence);
                    return NextRecord::Record(record);
                }
            }
        }
    }

    /// Records this subscriber lost to a full mailbox.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn already_seen(&self, sequence: u64) -> bool {
        self.last_sequence.is_some_and(|last| sequence <= last)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant as StdInstant};
    use tracelink_types::TraceSource;

    fn line(text: &str) -> FramedLine {
        FramedLine {
            text: text.to_string(),
            timestamp_ns: 0,
            source: TraceSource::Stdout,
        }
    }

    fn bus(backlog: usize, mailbox: usize) -> Arc<TraceBus> {
        Arc::new(TraceBus::new(backlog, mailbox))
    }

    #[tokio::test]
    async fn replay_observes_appends_in_order_gap_free() {
        let bus = bus(64, 64);
        for i in 0..10 {
            bus.append(line(&format!("t{}", i)));
        }
        let mut sub = bus.subscribe(StartFrom::ReplayAll);
        let mut expected = 0;
        while expected < 10 {
            match sub.next(None).await {
                NextRecord::Record(record) => {
                    assert_eq!(record.sequence, expected);
                    assert_eq!(record.text, format!("t{}", expected));
                    expected += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn live_subscription_skips_backlog() {
        let bus = bus(64, 64);
        bus.append(line("old"));
        let mut sub = bus.subscribe(StartFrom::Live);
        bus.append(line("new"));
        match sub.next(None).await {
            NextRecord::Record(record) => assert_eq!(record.text, "new"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn replay_then_live_has_no_duplicates() {
        let bus = bus(64, 64);
        bus.append(line("a"));
        let mut sub = bus.subscribe(StartFrom::ReplayAll);
        bus.append(line("b"));
        let mut texts = Vec::new();
        for _ in 0..2 {
            match sub.next(None).await {
                NextRecord::Record(record) => texts.push(record.text),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn backlog_capacity_evicts_oldest() {
        let bus = bus(3, 64);
        for i in 0..5 {
            bus.append(line(&format!("t{}", i)));
        }
        assert_eq!(bus.evicted(), 2);
        let mut sub = bus.subscribe(StartFrom::ReplayAll);
        match sub.next(None).await {
            NextRecord::Record(record) => {
                assert_eq!(record.text, "t2");
                assert_eq!(record.sequence, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_mailbox_drops_for_that_subscriber_only() {
        let bus = bus(64, 2);
        let slow = bus.subscribe(StartFrom::Live);
        let mut fast = bus.subscribe(StartFrom::Live);
        for i in 0..4 {
            bus.append(line(&format!("t{}", i)));
            // Drain the fast subscriber so its mailbox never fills.
            match fast.next(None).await {
                NextRecord::Record(record) => assert_eq!(record.text, format!("t{}", i)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(slow.dropped(), 2);
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn clear_backlog_keeps_materialized_replay() {
        let bus = bus(64, 64);
        bus.append(line("kept"));
        let mut sub = bus.subscribe(StartFrom::ReplayAll);
        bus.clear_backlog();
        match sub.next(None).await {
            NextRecord::Record(record) => assert_eq!(record.text, "kept"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_drains_then_reports_closed() {
        let bus = bus(64, 64);
        let mut sub = bus.subscribe(StartFrom::Live);
        bus.append(line("last"));
        bus.close();
        match sub.next(None).await {
            NextRecord::Record(record) => assert_eq!(record.text, "last"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(sub.next(None).await, NextRecord::Closed));
        assert!(bus.append(line("late")).is_none());
    }

    #[tokio::test]
    async fn next_times_out() {
        let bus = bus(64, 64);
        let mut sub = bus.subscribe(StartFrom::Live);
        let started = StdInstant::now();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(matches!(sub.next(Some(deadline)).await, NextRecord::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn dropped_subscription_unregisters() {
        let bus = bus(64, 64);
        let sub = bus.subscribe(StartFrom::Live);
        drop(sub);
        bus.append(line("t"));
        assert_eq!(bus.state.lock().unwrap().subscribers.len(), 0);
    }
}
