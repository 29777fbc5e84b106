//! Child process control: spawn, reap, terminate the whole tree.
//!
//! Children are placed in their own process group so that descendants can be
//! terminated as a unit: SIGTERM to the group, a grace period, then SIGKILL.
//! A reaper task publishes the exit status on a watch channel for
//! run-to-completion waits.

use crate::{Result, TracelinkError};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tracelink_types::ProcessConfig;
use tracing::{debug, info, warn};

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_MS: u64 = 250;

/// Exit status of a reaped child. `code` is `None` when the child was
/// killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Pipes of a freshly spawned child.
pub struct SpawnedChild {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub stdin: ChildStdin,
}

/// Spawns one child at a time and terminates its entire process tree.
pub struct ProcessController {
    grace: Duration,
    pgid: Mutex<Option<i32>>,
    exit_tx: watch::Sender<Option<ChildExit>>,
}

impl ProcessController {
    pub fn new(grace_ms: u64) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            grace: Duration::from_millis(grace_ms),
            pgid: Mutex::new(None),
            exit_tx,
        }
    }

    /// Spawn the configured command with piped stdio, in its own process
    /// group, and start a reaper task for it.
    pub fn start(&self, config: &ProcessConfig) -> Result<SpawnedChild> {
        let program = config.argv.first().ok_or(TracelinkError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(&config.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        info!(target: "tracelink::process", "spawning {:?}", config.argv);
        let mut child = cmd
            .spawn()
            .map_err(|e| TracelinkError::ProcessSpawnFailed(format!("{:?}: {}", program, e)))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let stdin = child.stdin.take().expect("stdin was piped");

        let pid = child.id().map(|pid| pid as i32);
        *self.pgid.lock().expect("pgid lock poisoned") = pid;
        let _ = self.exit_tx.send(None);

        self.spawn_reaper(child);

        Ok(SpawnedChild {
            stdout,
            stderr,
            stdin,
        })
    }

    /// Watch channel carrying the child's exit status once reaped.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ChildExit>> {
        self.exit_tx.subscribe()
    }

    /// Terminate the child and all of its descendants. Graceful signal
    /// first, forced kill of the group after the grace period, then wait
    /// for the reaper. Idempotent; a no-op once the child has been reaped.
    pub async fn terminate_tree(&self) {
        let pgid = *self.pgid.lock().expect("pgid lock poisoned");
        let Some(pgid) = pgid else {
            return;
        };
        let mut exit_rx = self.exit_tx.subscribe();
        if exit_rx.borrow().is_some() {
            return;
        }

        debug!(target: "tracelink::process", pgid, "terminating process group");
        signal_group(pgid, TreeSignal::Term);

        let timed_out = {
            tokio::time::timeout(self.grace, exit_rx.wait_for(|e| e.is_some()))
                .await
                .is_err()
        };
        if timed_out {
            warn!(target: "tracelink::process", pgid, "grace period expired, killing group");
            signal_group(pgid, TreeSignal::Kill);
            let _ = exit_rx.wait_for(|e| e.is_some()).await;
        }
    }

    fn spawn_reaper(&self, mut child: Child) {
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ChildExit {
                    code: status.code(),
                },
                Err(e) => {
                    warn!(target: "tracelink::process", "reaper wait failed: {}", e);
                    ChildExit { code: None }
                }
            };
            info!(target: "tracelink::process", code = ?exit.code, "child exited");
            let _ = exit_tx.send(Some(exit));
        });
    }
}

enum TreeSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: TreeSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        TreeSignal::Term => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };
    // ESRCH just means the group is already gone.
    if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
        if e != nix::errno::Errno::ESRCH {
            warn!(target: "tracelink::process", pgid, "killpg failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(pgid: i32, _signal: TreeSignal) {
    warn!(target: "tracelink::process", pgid, "process-group termination is unix-only");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reaper_publishes_exit_code() {
        let controller = ProcessController::new(DEFAULT_GRACE_MS);
        let _child = controller
            .start(&ProcessConfig::shell("exit 7"))
            .unwrap();
        let mut exit_rx = controller.exit_watch();
        let exit = exit_rx.wait_for(|e| e.is_some()).await.unwrap().unwrap();
        assert_eq!(exit.code, Some(7));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn terminate_tree_kills_long_running_child() {
        let controller = ProcessController::new(DEFAULT_GRACE_MS);
        let _child = controller
            .start(&ProcessConfig::shell("sleep 60"))
            .unwrap();
        controller.terminate_tree().await;
        let exit_rx = controller.exit_watch();
        let exit = *exit_rx.borrow();
        assert!(matches!(exit, Some(ChildExit { code: None })));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let controller = ProcessController::new(DEFAULT_GRACE_MS);
        let result = controller.start(&ProcessConfig::new(Vec::new()));
        assert!(matches!(result, Err(TracelinkError::EmptyCommand)));
    }
}
