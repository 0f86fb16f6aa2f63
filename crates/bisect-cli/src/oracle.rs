//! The interactive confirm-prompt oracle. Kept out of `bisect-core` since
//! it owns the one dependency that crate deliberately stays free of: the
//! interactive prompt library.

use anyhow::{Context, Result};
use bisect_core::Oracle;
use bisect_types::TimelineEvent;
use dialoguer::Confirm;

/// Asks the user, once per candidate, whether the project works now.
pub struct PromptOracle;

impl PromptOracle {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PromptOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl Oracle for PromptOracle {
    fn works(&mut self, candidate: &TimelineEvent) -> Result<bool> {
        Confirm::new()
            .with_prompt(format!(
                "Reinstalled with {}@{} hidden. Does the project work now?",
                candidate.package_name, candidate.version
            ))
            .default(false)
            .interact()
            .context("failed to read interactive confirmation")
    }
}
