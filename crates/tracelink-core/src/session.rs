//! Session facade: one transport, its framers, one bus, one event map.
//!
//! A background producer task per transport stream pulls bytes, frames them,
//! and appends to the bus. Waits run on the caller's task and consume a bus
//! subscription. Start/stop of capture is idempotent; stopping drains the
//! producers before the transport is released, so no record is produced
//! after `stop_capturing` returns.

use crate::bus::{Subscription, TraceBus, DEFAULT_BACKLOG_CAPACITY, DEFAULT_MAILBOX_CAPACITY};
use crate::events::{EventMap, PatternRef};
use crate::framer::LineFramer;
use crate::process::ChildExit;
use crate::transport::{Transport, TransportControl, TransportStream, TransportWriter};
use crate::waiter::{self, WaitOptions};
use crate::{Result, TracelinkError};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracelink_types::{EventTag, StartFrom, WaitOutcome};
use tracing::{debug, info, trace, warn};

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name used in logs.
    pub name: String,
    /// Terminator appended to every `send_cmd` payload.
    pub line_terminator: String,
    pub backlog_capacity: usize,
    pub mailbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            line_terminator: "\n".to_string(),
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

struct CaptureState {
    running: bool,
    cancel: CancellationToken,
    completion: Option<JoinHandle<()>>,
    control: Option<Box<dyn TransportControl>>,
    exit: Option<watch::Receiver<Option<ChildExit>>>,
}

/// One capture session over one transport.
pub struct Session {
    config: SessionConfig,
    transport: Mutex<Box<dyn Transport>>,
    bus: OnceLock<Arc<TraceBus>>,
    event_map: EventMap,
    writer: Mutex<Option<Box<dyn TransportWriter>>>,
    capture: Mutex<CaptureState>,
    // Concurrent waits sharing one session are not defined; serialize them.
    wait_lock: Mutex<()>,
    shutdown: CancellationToken,
    epoch: Instant,
}

impl Session {
    pub fn new(transport: impl Transport + 'static, config: SessionConfig) -> Self {
        Self {
            config,
            transport: Mutex::new(Box::new(transport)),
            bus: OnceLock::new(),
            event_map: EventMap::new(),
            writer: Mutex::new(None),
            capture: Mutex::new(CaptureState {
                running: false,
                cancel: CancellationToken::new(),
                completion: None,
                control: None,
                exit: None,
            }),
            wait_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            epoch: Instant::now(),
        }
    }

    /// Install the tag-to-pattern map. Replaces the active map atomically;
    /// in-flight waits keep the snapshot they resolved against.
    pub fn set_event_map<I, S>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (EventTag, S)>,
        S: AsRef<str>,
    {
        self.event_map.set(entries)
    }

    pub async fn is_capturing(&self) -> bool {
        self.capture.lock().await.running
    }

    /// Open the transport and start the producer tasks. Idempotent.
    pub async fn start_capturing(&self) -> Result<()> {
        let mut capture = self.capture.lock().await;
        if capture.running {
            debug!(target: "tracelink::session", name = %self.config.name, "capture already running; ignoring start request");
            return Ok(());
        }

        let bus = self.bus_handle();
        bus.reopen();

        let pair = self.transport.lock().await.open().await?;
        *self.writer.lock().await = pair.writer;
        capture.exit = pair.exit.clone();
        capture.control = pair.control;

        let cancel = self.shutdown.child_token();
        let mut producers = Vec::new();
        for stream in pair.streams {
            producers.push(self.spawn_producer(stream, bus.clone(), cancel.clone()));
        }

        // Once every producer has drained, wait for the child to be reaped
        // (process-backed transports) and close the bus so waiters observe
        // the exit instead of hanging. A cancelled capture skips the reap
        // wait; stop_capturing owns teardown in that case.
        let exit = pair.exit;
        let completion_cancel = cancel.clone();
        let completion_bus = bus.clone();
        let completion = tokio::spawn(async move {
            for producer in producers {
                let _ = producer.await;
            }
            if !completion_cancel.is_cancelled() {
                if let Some(mut exit_rx) = exit {
                    let _ = exit_rx.wait_for(|e| e.is_some()).await;
                }
            }
            completion_bus.close();
        });

        capture.cancel = cancel;
        capture.completion = Some(completion);
        capture.running = true;
        info!(target: "tracelink::session", name = %self.config.name, "capture started");
        Ok(())
    }

    /// Stop the producers, close the transport, and close the bus.
    /// Idempotent. Outstanding waits observe `TransportClosed`.
    pub async fn stop_capturing(&self) -> Result<()> {
        let mut capture = self.capture.lock().await;
        if !capture.running {
            debug!(target: "tracelink::session", name = %self.config.name, "not capturing; ignoring stop request");
            return Ok(());
        }

        capture.cancel.cancel();
        if let Some(mut control) = capture.control.take() {
            control.close().await;
        }
        if let Some(completion) = capture.completion.take() {
            let _ = completion.await;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.bus_handle().close();

        capture.exit = None;
        capture.running = false;
        info!(target: "tracelink::session", name = %self.config.name, "capture stopped");
        Ok(())
    }

    /// Write a command to the transport, with the configured line
    /// terminator appended. Starts capture first when needed. Writes are
    /// serialized by the writer lock.
    pub async fn send_cmd(&self, cmd: &str) -> Result<()> {
        self.ensure_capturing().await?;
        let mut writer_slot = self.writer.lock().await;
        let writer = writer_slot.as_mut().ok_or(TracelinkError::NotWritable)?;
        debug!(target: "tracelink::session", name = %self.config.name, "--> {}", cmd);
        let mut framed = cmd.as_bytes().to_vec();
        framed.extend_from_slice(self.config.line_terminator.as_bytes());
        writer.write_chunk(&framed).await?;
        Ok(())
    }

    /// Issue an optional command, then block until the required patterns
    /// are satisfied, an avoided pattern matches, or the deadline expires.
    ///
    /// The subscription is taken before the command is sent, so no trace
    /// produced by the command can be missed. Configuration errors (unknown
    /// event tag, invalid regex) fail before any side effect.
    ///
    /// With no required patterns and `run_to_completion` unset the wait is
    /// degenerate and returns `Accepted` immediately.
    pub async fn wait_for_trace(
        &self,
        cmd: Option<&str>,
        required: Vec<PatternRef>,
        avoided: Vec<PatternRef>,
        options: WaitOptions,
    ) -> Result<WaitOutcome> {
        let required = self.event_map.resolve(&required)?;
        let avoided = self.event_map.resolve(&avoided)?;
        self.ensure_capturing().await?;

        let _wait_guard = self.wait_lock.lock().await;

        let bus = self.bus_handle();
        if !options.use_backlog {
            bus.clear_backlog();
        }
        let start_from = if options.use_backlog {
            StartFrom::ReplayAll
        } else {
            StartFrom::Live
        };
        let subscription = bus.subscribe(start_from);

        if let Some(cmd) = cmd {
            self.send_cmd(cmd).await?;
        }

        let cancel = options.cancel.clone().unwrap_or_default();
        let exit = self.capture.lock().await.exit.clone();

        Ok(waiter::run(
            required,
            avoided,
            &options,
            subscription,
            cancel,
            Some(self.shutdown.clone()),
            exit,
        )
        .await)
    }

    /// Like [`wait_for_trace`], with patterns resolved from event tags.
    /// Fails fast when no event map is installed or a tag is unknown.
    ///
    /// [`wait_for_trace`]: Session::wait_for_trace
    pub async fn wait_for_event(
        &self,
        cmd: Option<&str>,
        required: Vec<EventTag>,
        avoided: Vec<EventTag>,
        options: WaitOptions,
    ) -> Result<WaitOutcome> {
        if !self.event_map.is_set() {
            return Err(TracelinkError::EventMapNotSet);
        }
        let required = required.into_iter().map(PatternRef::Tagged).collect();
        let avoided = avoided.into_iter().map(PatternRef::Tagged).collect();
        self.wait_for_trace(cmd, required, avoided, options).await
    }

    /// A raw cursor over the bus for custom consumers.
    pub async fn raw_queue(&self, start_from: StartFrom) -> Result<Subscription> {
        self.ensure_capturing().await?;
        Ok(self.bus_handle().subscribe(start_from))
    }

    /// Drop all retained traces.
    pub fn clear_backlog(&self) {
        self.bus_handle().clear_backlog();
    }

    /// Child-exit watch of the current capture, for process-backed
    /// transports.
    pub async fn exit_watch(&self) -> Option<watch::Receiver<Option<ChildExit>>> {
        self.capture.lock().await.exit.clone()
    }

    /// Tear the session down: cancel outstanding waits, stop capture,
    /// close the transport and the bus. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.stop_capturing().await;
    }

    async fn ensure_capturing(&self) -> Result<()> {
        if !self.is_capturing().await {
            self.start_capturing().await?;
        }
        Ok(())
    }

    fn bus_handle(&self) -> Arc<TraceBus> {
        self.bus
            .get_or_init(|| {
                Arc::new(TraceBus::new(
                    self.config.backlog_capacity,
                    self.config.mailbox_capacity,
                ))
            })
            .clone()
    }

    fn spawn_producer(
        &self,
        stream: TransportStream,
        bus: Arc<TraceBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let source = stream.source;
        let mut reader = stream.reader;
        let mut framer = LineFramer::new(source, self.epoch);
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = reader.read_chunk() => chunk,
                };
                match chunk {
                    Ok(Some(bytes)) => {
                        for line in framer.push(&bytes) {
                            trace!(target: "tracelink::session", %source, "<-- {}", line.text);
                            bus.append(line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target: "tracelink::session", %source, "read failed: {}", e);
                        break;
                    }
                }
            }
            if let Some(residue) = framer.finish() {
                bus.append(residue);
            }
            debug!(target: "tracelink::session", %source, "producer finished");
        })
    }
}
