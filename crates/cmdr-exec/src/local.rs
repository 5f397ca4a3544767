//! Local command execution using `tokio::process`

use std::ffi::OsStr;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::config::ExecConfig;
use crate::error::ExecError;
use crate::executor::{Channels, ExecOptions, drive};
use crate::result::Completion;
use crate::stream::{Framing, StreamKind, pipe_open_error};
use crate::traits::{BackendKind, PipeReader, PipeWriter, Session, Terminate};

/// A local child process that has not been started yet
///
/// Pipes are real OS pipes created before the spawn, so output can be read
/// from the moment the process starts. Streams nobody asked for are
/// connected to the null device.
pub struct LocalProcess {
    program: String,
    command: Option<Command>,
    kill: Arc<Notify>,
    reaper: Option<JoinHandle<io::Result<ExitStatus>>>,
}

impl LocalProcess {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut std_command = std::process::Command::new(program);
        std_command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        Self {
            program: program.to_string(),
            command: Some(command),
            kill: Arc::new(Notify::new()),
            reaper: None,
        }
    }

    fn command(&mut self, stream: StreamKind) -> Result<&mut Command, ExecError> {
        self.command
            .as_mut()
            .ok_or_else(|| pipe_open_error(stream, "process already started"))
    }

    fn open_output(&mut self, stream: StreamKind) -> Result<PipeReader, ExecError> {
        let command = self.command(stream)?;
        let (reader, writer) = io::pipe().map_err(|e| pipe_open_error(stream, e))?;
        let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
            .map_err(|e| pipe_open_error(stream, e))?;

        if stream == StreamKind::Stderr {
            command.stderr(writer);
        } else {
            command.stdout(writer);
        }
        Ok(Box::new(reader))
    }
}

/// Owns the child until it exits, killing it when asked to
///
/// The child leads its own process group; the whole group is killed so
/// descendants holding the stdio pipes die with it.
async fn reap(mut child: Child, kill: Arc<Notify>) -> io::Result<ExitStatus> {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = kill.notified() => None,
    };

    match exited {
        Some(status) => status,
        None => {
            kill_group(&mut child);
            child.wait().await
        }
    }
}

fn kill_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    debug!(pid, "killing process group");

    let pgid = Pid::from_raw(pid.cast_signed());
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        warn!(pid, error = %e, "failed to kill process group, killing process");
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "failed to kill process");
        }
    }
}

#[async_trait]
impl Session for LocalProcess {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn open_stdin(&mut self) -> Result<PipeWriter, ExecError> {
        let command = self.command(StreamKind::Stdin)?;
        let (reader, writer) = io::pipe().map_err(|e| pipe_open_error(StreamKind::Stdin, e))?;
        let writer = pipe::Sender::from_owned_fd(OwnedFd::from(writer))
            .map_err(|e| pipe_open_error(StreamKind::Stdin, e))?;

        command.stdin(reader);
        Ok(Box::new(writer))
    }

    fn open_stdout(&mut self) -> Result<PipeReader, ExecError> {
        self.open_output(StreamKind::Stdout)
    }

    fn open_stderr(&mut self) -> Result<PipeReader, ExecError> {
        self.open_output(StreamKind::Stderr)
    }

    async fn start(&mut self, _command: Option<&str>) -> Result<(), ExecError> {
        let mut command = self
            .command
            .take()
            .ok_or_else(|| ExecError::Start("process already started".to_string()))?;

        let spawned = command.spawn();
        // the builder still holds the child's pipe ends; readers only see
        // end of data once they are closed here
        drop(command);
        let child = spawned.map_err(|e| ExecError::Start(format!("{}: {e}", self.program)))?;

        debug!(program = %self.program, pid = ?child.id(), "process spawned");
        self.reaper = Some(tokio::spawn(reap(child, self.kill.clone())));
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>, ExecError> {
        let reaper = self
            .reaper
            .take()
            .ok_or_else(|| ExecError::Wait("process was never started".to_string()))?;

        let status = reaper
            .await
            .map_err(|e| ExecError::Wait(e.to_string()))?
            .map_err(|e| ExecError::Wait(e.to_string()))?;
        Ok(status.code())
    }

    fn terminator(&self) -> Arc<dyn Terminate> {
        Arc::new(ProcessKiller {
            kill: self.kill.clone(),
        })
    }
}

/// Kills a local process through its reaper
struct ProcessKiller {
    kill: Arc<Notify>,
}

#[async_trait]
impl Terminate for ProcessKiller {
    async fn terminate(&self) {
        // stores a permit if the reaper is not listening; harmless once it exited
        self.kill.notify_one();
    }
}

/// Local command executor
///
/// Runs a program as a child process, streaming its stdio through the
/// configured channels. One executor drives one execution at a time;
/// `execute` takes `&mut self`, so callers serialize calls on an instance.
#[derive(Debug, Default)]
pub struct LocalExecutor {
    channels: Channels,
    options: ExecOptions,
}

impl LocalExecutor {
    /// Create a new local executor
    ///
    /// Any channel may be `None` to leave that stream unconnected.
    #[must_use]
    pub fn new(
        stdin: Option<tokio::sync::mpsc::Receiver<String>>,
        stdout: Option<tokio::sync::mpsc::Sender<String>>,
        stderr: Option<tokio::sync::mpsc::Sender<String>>,
    ) -> Self {
        Self {
            channels: Channels::new(stdin, stdout, stderr),
            options: ExecOptions::default(),
        }
    }

    /// Set the wall-clock timeout; zero disables it
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.options.timeout = timeout;
    }

    pub fn set_stdout_framing(&mut self, framing: Framing) {
        self.options.stdout = framing;
    }

    pub fn set_stderr_framing(&mut self, framing: Framing) {
        self.options.stderr = framing;
    }

    /// Install channels for the next execution
    pub fn set_channels(&mut self, channels: Channels) {
        self.channels = channels;
    }

    /// Apply timeout and framing settings
    ///
    /// # Errors
    /// Returns `ExecError::Config` if the settings are invalid
    pub fn apply_config(&mut self, config: &ExecConfig) -> Result<(), ExecError> {
        self.options = config.options()?;
        Ok(())
    }

    #[must_use]
    pub fn options(&self) -> ExecOptions {
        self.options
    }

    /// Run `program` with `args` to completion
    ///
    /// The channels are consumed by this call; install new ones with
    /// [`LocalExecutor::set_channels`] before running again.
    ///
    /// # Errors
    /// Returns `ExecError::PipeOpen` or `ExecError::Start` if the process
    /// could not be set up, `ExecError::Streams` if stdio failed and
    /// `ExecError::Timeout` if the process outlived the timeout and was
    /// killed
    #[instrument(skip(self, args), level = "debug")]
    pub async fn execute<I, S>(&mut self, program: &str, args: I) -> Result<Completion, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        debug!(program = %program, timeout = ?self.options.timeout, "executing local command");

        let mut process = LocalProcess::new(program, args);
        let channels = std::mem::take(&mut self.channels);
        let result = drive(&mut process, channels, None, self.options).await;

        match &result {
            Ok(completion) => debug!(
                program = %program,
                status = ?completion.code,
                duration = ?completion.duration,
                "command completed"
            ),
            Err(e) => error!(program = %program, error = %e, "command failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    async fn collect(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_run_success() {
        let (tx, rx) = mpsc::channel(16);
        let mut executor = LocalExecutor::new(None, Some(tx), None);

        let result = executor.execute("echo", ["hello"]).await.unwrap();

        assert!(result.success());
        assert_eq!(collect(rx).await, vec!["hello\n"]);
    }

    #[tokio::test]
    async fn test_run_failure() {
        let mut executor = LocalExecutor::default();
        let result = executor.execute("sh", ["-c", "exit 42"]).await.unwrap();

        assert!(!result.success());
        assert_eq!(result.code, Some(42));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let mut executor = LocalExecutor::default();
        executor.set_timeout(Duration::from_millis(100));

        let result = executor.execute("sleep", ["5"]).await;

        assert!(matches!(
            result,
            Err(ExecError::Timeout {
                backend: BackendKind::Local,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_run_with_stderr() {
        let (tx, rx) = mpsc::channel(16);
        let mut executor = LocalExecutor::new(None, None, Some(tx));

        let result = executor
            .execute("sh", ["-c", "echo error >&2"])
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(collect(rx).await, vec!["error\n"]);
    }

    #[tokio::test]
    async fn test_stdin_reaches_process() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, out_rx) = mpsc::channel(16);
        let mut executor = LocalExecutor::new(Some(in_rx), Some(out_tx), None);

        in_tx.send("alpha\n".to_string()).await.unwrap();
        in_tx.send("beta\n".to_string()).await.unwrap();
        drop(in_tx);

        let result = executor.execute("cat", Vec::<String>::new()).await.unwrap();

        assert!(result.success());
        assert_eq!(collect(out_rx).await, vec!["alpha\n", "beta\n"]);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let (tx, rx) = mpsc::channel(16);
        let mut executor = LocalExecutor::new(None, Some(tx), None);

        let result = executor
            .execute("/nonexistent/cmdr-test-binary", ["x"])
            .await;

        assert!(matches!(result, Err(ExecError::Start(_))));
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_reuse_with_fresh_channels() {
        let mut executor = LocalExecutor::default();

        for word in ["first", "second"] {
            let (tx, rx) = mpsc::channel(16);
            executor.set_channels(Channels::new(None, Some(tx), None));
            executor.execute("echo", [word]).await.unwrap();
            assert_eq!(collect(rx).await, vec![format!("{word}\n")]);
        }
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_harmless() {
        let mut process = LocalProcess::new("true", Vec::<String>::new());
        process.start(None).await.unwrap();
        let terminator = process.terminator();

        let code = process.wait().await.unwrap();
        terminator.terminate().await;

        assert_eq!(code, Some(0));
    }
}
