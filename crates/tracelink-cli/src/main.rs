//! tracelink - run a CLI process and react to its output.
//!
//! Spawns the command in its own process group, frames stdout/stderr into
//! trace records, and waits until the required patterns are seen, an avoided
//! pattern is seen, or the timeout expires. The whole process tree is
//! terminated on the way out.

mod logging;

use clap::Parser;
use logging::{LogFormat, LogPreset};
use std::process::ExitCode;
use tracelink_core::{ProcessRunner, RunnerOptions, TracelinkError};
use tracelink_types::{TerminatedBy, WaitOutcome};

/// A tool to run a CLI process and handle its output.
#[derive(Parser, Debug)]
#[command(name = "tracelink")]
#[command(about = "Run a CLI process and wait on its output patterns")]
#[command(version)]
struct Cli {
    /// Command to run (through `/bin/sh -c`)
    #[arg(short = 'c', long)]
    cmd: String,

    /// Comma-separated list of required response patterns (regex)
    #[arg(short = 'r', long = "required", value_delimiter = ',')]
    required: Vec<String>,

    /// Quit immediately if any of these patterns is seen (comma-separated regex)
    #[arg(short = 'a', long = "avoid", value_delimiter = ',')]
    avoid: Vec<String>,

    /// Max process runtime in milliseconds. 0 runs forever
    #[arg(short = 't', long = "timeout-ms", default_value_t = 10_000)]
    timeout_ms: u64,

    /// Return immediately upon finding any required pattern
    #[arg(short = 'f', long = "first-match")]
    first_match: bool,

    /// Run until the process exits naturally
    #[arg(long)]
    run_to_completion: bool,

    /// Collect every trace instead of only the most recent one
    #[arg(long)]
    accumulate: bool,

    /// Do not echo the child's output to stdout
    #[arg(long)]
    quiet: bool,

    /// Delay before teardown after a successful wait, for commands driving
    /// hardware that needs to quiesce
    #[arg(long = "recovery-ms", default_value_t = 0)]
    recovery_ms: u64,

    /// Grace period between SIGTERM and SIGKILL of the process tree
    #[arg(long = "grace-ms", default_value_t = 250)]
    grace_ms: u64,

    /// Operational logging (session lifecycle, wait terminations)
    #[arg(short, long)]
    verbose: bool,

    /// Per-record debug logging
    #[arg(long)]
    debug: bool,

    /// Log output format
    #[arg(long = "log-format", value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,
}

/// Exit codes: 0 success, 1 required-not-found, 2 avoided-seen, 3 timeout,
/// 4 spawn/transport error, 5 configuration error.
fn exit_code(result: &Result<WaitOutcome, TracelinkError>) -> u8 {
    match result {
        Ok(outcome) if outcome.successful => 0,
        Ok(outcome) => match &outcome.terminated_by {
            TerminatedBy::Rejected { .. } => 2,
            TerminatedBy::Timeout => 3,
            TerminatedBy::TransportClosed => 4,
            _ => 1,
        },
        Err(
            TracelinkError::EventMapNotSet
            | TracelinkError::UnknownEventTag(_)
            | TracelinkError::DuplicateEventTag(_)
            | TracelinkError::DuplicatePattern(_)
            | TracelinkError::InvalidPattern(_)
            | TracelinkError::EmptyCommand,
        ) => 5,
        Err(_) => 4,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(
        LogPreset::from_flags(cli.verbose, cli.debug),
        cli.log_format,
    );

    let options = RunnerOptions {
        required: cli.required,
        avoided: cli.avoid,
        timeout_ms: cli.timeout_ms,
        run_to_completion: cli.run_to_completion,
        accumulate: cli.accumulate,
        return_on_first_match: cli.first_match,
        recovery_ms: cli.recovery_ms,
        grace_ms: cli.grace_ms,
        quiet: cli.quiet,
    };
    let runner = ProcessRunner::shell(&cli.cmd, options);

    if !cli.quiet {
        println!("########## Beginning Process ##########");
    }

    let result = runner.run().await;

    match &result {
        Ok(outcome) => {
            if !cli.quiet {
                println!("########## End of Process ##########");
            }
            println!(" success = {}", outcome.successful);
            println!(" traces = '{}'", outcome.texts().join("\n"));
            println!(
                " required_remaining = [{}]",
                outcome
                    .required_remaining
                    .iter()
                    .map(|p| p.pattern.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Err(e) => eprintln!("error: {}", e),
    }

    ExitCode::from(exit_code(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracelink_types::CancelReason;

    fn outcome(successful: bool, terminated_by: TerminatedBy) -> Result<WaitOutcome, TracelinkError> {
        Ok(WaitOutcome {
            successful,
            results: Vec::new(),
            required_remaining: Vec::new(),
            terminated_by,
        })
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(exit_code(&outcome(true, TerminatedBy::Accepted)), 0);
        assert_eq!(
            exit_code(&outcome(
                true,
                TerminatedBy::ProcessExited { code: Some(0) }
            )),
            0
        );
        assert_eq!(
            exit_code(&outcome(
                false,
                TerminatedBy::ProcessExited { code: Some(1) }
            )),
            1
        );
        assert_eq!(
            exit_code(&outcome(
                false,
                TerminatedBy::Cancelled {
                    reason: CancelReason::Requested
                }
            )),
            1
        );
        assert_eq!(
            exit_code(&outcome(
                false,
                TerminatedBy::Rejected {
                    pattern: "boom".to_string()
                }
            )),
            2
        );
        assert_eq!(exit_code(&outcome(false, TerminatedBy::Timeout)), 3);
        assert_eq!(exit_code(&outcome(false, TerminatedBy::TransportClosed)), 4);
        assert_eq!(
            exit_code(&Err(TracelinkError::ProcessSpawnFailed("nope".into()))),
            4
        );
        assert_eq!(exit_code(&Err(TracelinkError::EventMapNotSet)), 5);
    }

    #[test]
    fn cli_parses_csv_patterns() {
        let cli = Cli::parse_from([
            "tracelink",
            "-c",
            "echo hi",
            "-r",
            "foo,bar",
            "-a",
            "fatal",
            "-t",
            "5000",
            "-f",
        ]);
        assert_eq!(cli.required, vec!["foo", "bar"]);
        assert_eq!(cli.avoid, vec!["fatal"]);
        assert_eq!(cli.timeout_ms, 5000);
        assert!(cli.first_match);
        assert!(!cli.run_to_completion);
    }
}
