//! cmdr-exec: Channel-streamed command execution
//!
//! Runs a command as a local child process or on a remote host over SSH,
//! streaming its stdin, stdout and stderr through `tokio::sync::mpsc`
//! channels and enforcing an optional timeout that forcibly terminates the
//! command. Both backends implement [`traits::Session`] and share one
//! orchestrator.
//!
//! There is no graceful cancellation: a timed out command is killed (local)
//! or its connection is closed (remote).

pub mod config;
pub mod credential;
pub mod error;
pub mod executor;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod stream;
mod timeout;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use config::{ConnectionInfo, ExecConfig, StreamConfig};
pub use credential::Credential;
pub use error::{ExecError, StreamErrors, StreamFailure};
pub use executor::{Channels, ExecOptions};
pub use keys::{KeyError, KeySource};
pub use local::LocalExecutor;
pub use result::Completion;
pub use ssh::RemoteExecutor;
pub use stream::{Framing, StreamKind};
pub use traits::BackendKind;
