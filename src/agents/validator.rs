//! Post-mutation validation
//!
//! Runs the configured shell commands in the workspace root. The first
//! failing command stops the sequence; a non-zero exit or a timeout is a
//! failure signal that the pipeline answers with a rollback.

use crate::config::ValidationCommand;
use crate::error::NebulaError;
use crate::util::tail_chars;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Output kept per check (tail, where compilers put the summary).
const MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    TimedOut,
    Skipped,
}

impl CheckStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "+",
            CheckStatus::Fail | CheckStatus::TimedOut => "●",
            CheckStatus::Skipped => "·",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(self, CheckStatus::Fail | CheckStatus::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr (truncated)
    pub output: String,
}

impl CheckResult {
    fn status_label(&self) -> String {
        match (self.status, self.exit_code) {
            (CheckStatus::TimedOut, _) => "timed out".to_string(),
            (_, Some(code)) => format!("exit code {}", code),
            (CheckStatus::Skipped, None) => "not started".to_string(),
            (_, None) => "terminated by signal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub checks: Vec<CheckResult>,
}

impl ValidationOutcome {
    pub fn passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status.is_failure())
    }

    /// The failing check as a `ShellValidation` error.
    pub fn failure(&self) -> Option<NebulaError> {
        self.checks
            .iter()
            .find(|c| c.status.is_failure())
            .map(|check| NebulaError::ShellValidation {
                command: check.name.clone(),
                status: check.status_label(),
                output: check.output.clone(),
            })
    }
}

/// Run `commands` in order, stopping at the first failure.
pub async fn validate(
    root: &Path,
    commands: &[ValidationCommand],
    timeout: Duration,
) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    for command in commands {
        let result = run_check(root, command, timeout).await;
        let failed = result.status.is_failure();
        outcome.checks.push(result);
        if failed {
            break;
        }
    }
    outcome
}

pub async fn run_check(root: &Path, command: &ValidationCommand, timeout: Duration) -> CheckResult {
    let name = command.display();
    debug!(command = %name, "running validation command");

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Dropping the output future on timeout kills the child
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(out)) => {
            let mut combined = String::new();
            if !out.stdout.is_empty() {
                combined.push_str(&String::from_utf8_lossy(&out.stdout));
            }
            if !out.stderr.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
            }

            let status = if out.status.success() {
                CheckStatus::Pass
            } else {
                CheckStatus::Fail
            };
            info!(command = %name, ?status, "validation command finished");
            CheckResult {
                name,
                status,
                exit_code: out.status.code(),
                output: tail_chars(combined.trim_end(), MAX_OUTPUT_CHARS),
            }
        }
        Ok(Err(e)) => {
            warn!(command = %name, error = %e, "validation command could not start, skipping");
            CheckResult {
                name,
                status: CheckStatus::Skipped,
                exit_code: None,
                output: format!("Failed to start command: {}", e),
            }
        }
        Err(_) => {
            warn!(command = %name, timeout_ms = timeout.as_millis() as u64, "validation command timed out");
            CheckResult {
                name,
                status: CheckStatus::TimedOut,
                exit_code: None,
                output: format!("Timed out after {}ms", timeout.as_millis()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[cfg(unix)]
    #[tokio::test]
    async fn passing_commands_run_in_workspace_root() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "present").unwrap();
        let commands = vec![
            ValidationCommand::new("cat", &["marker.txt"]),
            ValidationCommand::new("true", &[]),
        ];

        let outcome = validate(dir.path(), &commands, Duration::from_secs(10)).await;
        assert!(outcome.passed());
        assert_eq!(outcome.checks.len(), 2);
        assert_eq!(outcome.checks[0].output, "present");
        assert!(outcome.failure().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn first_failure_stops_the_sequence() {
        let dir = tempdir().unwrap();
        let commands = vec![
            ValidationCommand::new("sh", &["-c", "echo broken >&2; exit 3"]),
            ValidationCommand::new("true", &[]),
        ];

        let outcome = validate(dir.path(), &commands, Duration::from_secs(10)).await;
        assert!(!outcome.passed());
        assert_eq!(outcome.checks.len(), 1);
        assert_eq!(outcome.checks[0].exit_code, Some(3));

        match outcome.failure() {
            Some(NebulaError::ShellValidation {
                command,
                status,
                output,
            }) => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(status, "exit code 3");
                assert_eq!(output, "broken");
            }
            other => panic!("expected shell validation failure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempdir().unwrap();
        let commands = vec![ValidationCommand::new("sleep", &["5"])];

        let outcome = validate(dir.path(), &commands, Duration::from_millis(100)).await;
        assert_eq!(outcome.checks[0].status, CheckStatus::TimedOut);
        assert!(!outcome.passed());
        assert!(outcome.failure().unwrap().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_program_is_skipped() {
        let dir = tempdir().unwrap();
        let commands = vec![ValidationCommand::new("nebula-no-such-program-xyz", &[])];

        let outcome = validate(dir.path(), &commands, Duration::from_secs(5)).await;
        assert_eq!(outcome.checks[0].status, CheckStatus::Skipped);
        assert!(outcome.passed());
    }
}
