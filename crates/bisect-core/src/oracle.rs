//! The oracle: answers "does the project work now?" after a probe. Pure
//! with respect to search state — it never mutates the timeline or the
//! driver's indices, only answers a question about the candidate it was
//! asked about.
//!
//! The interactive yes/no variant lives in `bisect-cli`, since the
//! interactive prompt library is an external collaborator this crate
//! deliberately stays free of; this crate only defines the trait CLI
//! implementations satisfy, plus the one oracle that needs no prompt
//! library at all: running a user-supplied shell command.

use std::process::Command;

use anyhow::{Context, Result};
use bisect_types::TimelineEvent;

/// Answers whether the project works after a probe's install completed.
pub trait Oracle {
    fn works(&mut self, candidate: &TimelineEvent) -> Result<bool>;
}

/// Runs a shell command and treats exit code 0 as "works". The command is
/// run fresh for every candidate — the oracle itself carries no state
/// between calls.
pub struct CommandOracle {
    command: String,
}

impl CommandOracle {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Oracle for CommandOracle {
    fn works(&mut self, candidate: &TimelineEvent) -> Result<bool> {
        tracing::debug!(command = %self.command, candidate = %format!("{}@{}", candidate.package_name, candidate.version), "running oracle command");

        let shell_command = shell_invocation(&self.command);
        let status = Command::new(shell_command.0)
            .args(shell_command.1)
            .status()
            .with_context(|| format!("failed to run oracle command `{}`", self.command))?;

        Ok(status.success())
    }
}

#[cfg(unix)]
fn shell_invocation(command: &str) -> (&'static str, [&str; 2]) {
    ("/bin/sh", ["-c", command])
}

#[cfg(windows)]
fn shell_invocation(command: &str) -> (&'static str, [&str; 2]) {
    ("cmd", ["/C", command])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candidate() -> TimelineEvent {
        TimelineEvent::new("left-pad", "1.0.1", Utc::now())
    }

    #[test]
    fn zero_exit_is_treated_as_working() {
        let mut oracle = CommandOracle::new("exit 0");
        assert!(oracle.works(&candidate()).unwrap());
    }

    #[test]
    fn nonzero_exit_is_treated_as_not_working() {
        let mut oracle = CommandOracle::new("exit 1");
        assert!(!oracle.works(&candidate()).unwrap());
    }
}
