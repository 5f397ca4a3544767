//! Backend session traits

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ExecError;

/// Read end of a backend output pipe
pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write end of a backend input pipe
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Category of backend running a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Local child process
    Local,
    /// Command on a remote host over SSH
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Remote => f.write_str("remote SSH"),
        }
    }
}

/// Forceful termination of a running backend
///
/// There is no graceful cancellation: terminating kills the process or drops
/// the connection. Implementations must tolerate being called after the
/// backend already finished.
#[async_trait]
pub trait Terminate: Send + Sync {
    async fn terminate(&self);
}

/// A backend able to run exactly one command with optional stdio pipes
///
/// Pipes are opened before [`Session::start`]; [`Session::wait`] is called
/// once, after every stream task has finished.
#[async_trait]
pub trait Session: Send {
    /// Backend category, used to label timeout errors
    fn kind(&self) -> BackendKind;

    /// Open a pipe feeding the command's stdin
    fn open_stdin(&mut self) -> Result<PipeWriter, ExecError>;

    /// Open a pipe carrying the command's stdout
    fn open_stdout(&mut self) -> Result<PipeReader, ExecError>;

    /// Open a pipe carrying the command's stderr
    fn open_stderr(&mut self) -> Result<PipeReader, ExecError>;

    /// Start the command. Local processes fix their command at construction
    /// and receive `None`; remote sessions receive the command line.
    async fn start(&mut self, command: Option<&str>) -> Result<(), ExecError>;

    /// Wait for the command to finish and return its exit code, if any
    async fn wait(&mut self) -> Result<Option<i32>, ExecError>;

    /// Handle that forcibly terminates this backend
    fn terminator(&self) -> Arc<dyn Terminate>;
}
