//! Error types for cmdr-exec

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::stream::StreamKind;
use crate::traits::BackendKind;

/// Errors that can occur while preparing or running a command
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Incomplete or contradictory arguments
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// SSH key could not be read or parsed
    #[error("failed to load SSH key: {0}")]
    KeyLoad(String),

    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    Dial(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Failed to open a session on an established connection
    #[error("failed to open session: {0}")]
    SessionOpen(String),

    /// A requested stdio pipe could not be opened
    #[error("failed to open {stream} pipe: {reason}")]
    PipeOpen {
        /// Stream the pipe was requested for
        stream: StreamKind,
        /// Underlying failure
        reason: String,
    },

    /// The command could not be started
    #[error("failed to start command: {0}")]
    Start(String),

    /// One or more stdio streams failed while the command ran
    #[error(transparent)]
    Streams(StreamErrors),

    /// Command timed out and was terminated
    #[error("{backend} command execution timeout reached after {timeout:?}, terminating command")]
    Timeout {
        /// Backend category that timed out
        backend: BackendKind,
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Waiting for the backend to finish failed
    #[error("failed to wait for command: {0}")]
    Wait(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ExecError {
    /// Check if error is retryable
    ///
    /// Nothing in this crate retries; this only classifies the failure for
    /// callers that run their own retry policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Dial(_) | ExecError::Timeout { .. })
    }

    /// Whether this is a timeout error
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

/// A single failure reported by a stream task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    /// Stream that failed
    pub stream: StreamKind,
    /// Failure text
    pub message: String,
}

/// All stream failures collected during one execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamErrors(Vec<StreamFailure>);

impl StreamErrors {
    pub(crate) fn push(&mut self, stream: StreamKind, message: impl Into<String>) {
        self.0.push(StreamFailure {
            stream,
            message: message.into(),
        });
    }

    /// Collected failures in the order they were drained
    #[must_use]
    pub fn failures(&self) -> &[StreamFailure] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StreamErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("errors found processing I/O streams:")?;
        for (i, failure) in self.0.iter().enumerate() {
            let sep = if i == 0 { " " } else { "; " };
            write!(f, "{sep}{}: {}", failure.stream, failure.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for StreamErrors {}
