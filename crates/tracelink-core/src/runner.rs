//! One-shot process runner: spawn a command, react to its output, tear the
//! process tree down.
//!
//! Thin facade over a process-backed [`Session`] carrying the knobs the
//! command-line tool exposes. The child's stdout and stderr are framed into
//! one bus with distinct source tags; the wait engine drives acceptance,
//! rejection, timeout, and run-to-completion semantics.

use crate::bus::NextRecord;
use crate::events::PatternRef;
use crate::process::DEFAULT_GRACE_MS;
use crate::session::{Session, SessionConfig};
use crate::transport::ProcessTransport;
use crate::waiter::WaitOptions;
use crate::Result;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracelink_types::{CollectPattern, ProcessConfig, ResponseFormat, StartFrom, WaitOutcome};
use tracing::debug;

/// Options for one run.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub required: Vec<String>,
    pub avoided: Vec<String>,
    /// Max runtime in milliseconds. `0` disables the deadline.
    pub timeout_ms: u64,
    /// Wait for the child to exit; success is then its exit status plus
    /// any required patterns.
    pub run_to_completion: bool,
    /// Collect every trace instead of only the most recent one.
    pub accumulate: bool,
    /// Stop on any satisfied required pattern.
    pub return_on_first_match: bool,
    /// Delay before teardown after a successful wait, for commands driving
    /// hardware that must not be interrupted mid-transaction.
    pub recovery_ms: u64,
    /// Grace period between SIGTERM and SIGKILL of the process tree.
    pub grace_ms: u64,
    /// Suppress echoing the child's output to stdout.
    pub quiet: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            avoided: Vec::new(),
            timeout_ms: 10_000,
            run_to_completion: false,
            accumulate: false,
            return_on_first_match: false,
            recovery_ms: 0,
            grace_ms: DEFAULT_GRACE_MS,
            quiet: false,
        }
    }
}

/// Runs one command and waits on its output.
pub struct ProcessRunner {
    session: Session,
    options: RunnerOptions,
}

impl ProcessRunner {
    pub fn new(config: ProcessConfig, options: RunnerOptions) -> Self {
        let transport = ProcessTransport::with_grace(config, options.grace_ms);
        let session = Session::new(
            transport,
            SessionConfig {
                name: "runner".to_string(),
                ..SessionConfig::default()
            },
        );
        Self { session, options }
    }

    /// Run a shell command line through `/bin/sh -c`.
    pub fn shell(cmd: impl Into<String>, options: RunnerOptions) -> Self {
        Self::new(ProcessConfig::shell(cmd), options)
    }

    /// Spawn the command and wait until the acceptance, rejection, or
    /// timeout condition fires, then terminate the whole process tree.
    ///
    /// The runner may be reused; each call spawns a fresh child.
    pub async fn run(&self) -> Result<WaitOutcome> {
        self.session.start_capturing().await?;

        let echo = if self.options.quiet {
            None
        } else {
            Some(self.spawn_echo().await?)
        };

        let wait_options = WaitOptions {
            timeout_ms: self.options.timeout_ms,
            collect: CollectPattern::All,
            format: ResponseFormat::Raw,
            return_on_first_match: self.options.return_on_first_match,
            use_backlog: true,
            accumulate: self.options.accumulate,
            run_to_completion: self.options.run_to_completion,
            cancel: None,
        };
        let required = self
            .options
            .required
            .iter()
            .map(|pattern| PatternRef::from(pattern.as_str()))
            .collect();
        let avoided = self
            .options
            .avoided
            .iter()
            .map(|pattern| PatternRef::from(pattern.as_str()))
            .collect();

        let outcome = self
            .session
            .wait_for_trace(None, required, avoided, wait_options)
            .await?;
        debug!(
            target: "tracelink::runner",
            successful = outcome.successful,
            terminated_by = ?outcome.terminated_by,
            "wait finished"
        );

        if outcome.successful && self.options.recovery_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.options.recovery_ms)).await;
        }

        self.session.stop_capturing().await?;
        if let Some(echo) = echo {
            let _ = echo.await;
        }
        Ok(outcome)
    }

    async fn spawn_echo(&self) -> Result<JoinHandle<()>> {
        let mut subscription = self.session.raw_queue(StartFrom::ReplayAll).await?;
        Ok(tokio::spawn(async move {
            loop {
                match subscription.next(None).await {
                    NextRecord::Record(record) => println!("{}", record.text),
                    NextRecord::Closed => break,
                    NextRecord::Timeout => break,
                }
            }
        }))
    }
}
