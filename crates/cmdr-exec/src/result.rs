//! Result types for command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of a command that ran to completion
///
/// A non-zero exit code is not an error: the command ran and its streams
/// were fully delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Exit status code; `None` if the command was killed by a signal or the
    /// remote side never reported one
    pub code: Option<i32>,
    /// Time from opening the pipes to the command finishing
    pub duration: Duration,
}

impl Completion {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}
