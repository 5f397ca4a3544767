//! Execution orchestrator shared by the local and remote executors

use std::io;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ExecError, StreamErrors};
use crate::result::Completion;
use crate::stream::{Framing, StreamKind, pump_input, pump_output};
use crate::timeout::Watchdog;
use crate::traits::Session;

/// Caller-side ends of the stdio channels
///
/// A `None` entry leaves that stream unconnected. The channels are moved
/// into an execution; output senders are dropped when their stream ends,
/// which closes the caller's receivers.
#[derive(Debug, Default)]
pub struct Channels {
    /// Items written to the command's stdin
    pub stdin: Option<mpsc::Receiver<String>>,
    /// Items read from the command's stdout
    pub stdout: Option<mpsc::Sender<String>>,
    /// Items read from the command's stderr
    pub stderr: Option<mpsc::Sender<String>>,
}

impl Channels {
    pub fn new(
        stdin: Option<mpsc::Receiver<String>>,
        stdout: Option<mpsc::Sender<String>>,
        stderr: Option<mpsc::Sender<String>>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }
}

/// Per-execution settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Wall-clock limit; zero disables it
    pub timeout: Duration,
    /// Framing of stdout items
    pub stdout: Framing,
    /// Framing of stderr items
    pub stderr: Framing,
}

/// Stream task waiting to be confirmed finished
struct StreamTask {
    stream: StreamKind,
    notifier: mpsc::Receiver<io::Error>,
    handle: JoinHandle<()>,
}

/// Drive one execution against `session`
///
/// Opens the requested pipes, spawns a stream task per pipe, starts the
/// command alongside the timeout watchdog, drains every stream and finally
/// waits for the backend. Once the watchdog fires, streams still open are
/// abandoned. The reported result prefers a timeout over stream
/// failures, and stream failures over a failed wait.
pub(crate) async fn drive<S>(
    session: &mut S,
    channels: Channels,
    command: Option<&str>,
    options: ExecOptions,
) -> Result<Completion, ExecError>
where
    S: Session + ?Sized,
{
    let started = Instant::now();
    let backend = session.kind();

    let stdin = match channels.stdin {
        Some(rx) => Some((rx, session.open_stdin()?)),
        None => None,
    };
    let stdout = match channels.stdout {
        Some(tx) => Some((tx, session.open_stdout()?)),
        None => None,
    };
    let stderr = match channels.stderr {
        Some(tx) => Some((tx, session.open_stderr()?)),
        None => None,
    };
    debug!(
        %backend,
        stdin = stdin.is_some(),
        stdout = stdout.is_some(),
        stderr = stderr.is_some(),
        "pipes opened"
    );

    let mut tasks = Vec::with_capacity(3);
    if let Some((input, pipe)) = stdin {
        let (tx, rx) = mpsc::channel(1);
        tasks.push(StreamTask {
            stream: StreamKind::Stdin,
            notifier: rx,
            handle: tokio::spawn(pump_input(input, tx, pipe)),
        });
    }
    if let Some((output, pipe)) = stdout {
        let (tx, rx) = mpsc::channel(1);
        tasks.push(StreamTask {
            stream: StreamKind::Stdout,
            notifier: rx,
            handle: tokio::spawn(pump_output(pipe, output, tx, options.stdout)),
        });
    }
    if let Some((output, pipe)) = stderr {
        let (tx, rx) = mpsc::channel(1);
        tasks.push(StreamTask {
            stream: StreamKind::Stderr,
            notifier: rx,
            handle: tokio::spawn(pump_output(pipe, output, tx, options.stderr)),
        });
    }

    let mut watchdog = Watchdog::spawn(options.timeout, backend, session.terminator());

    if let Err(err) = session.start(command).await {
        for task in &tasks {
            task.handle.abort();
        }
        return Err(err);
    }
    debug!(%backend, "command started");

    // A held-open input channel or a pipe inherited by a descendant can keep
    // a stream task alive past termination, so draining races the watchdog
    let mut failures = StreamErrors::default();
    let mut expired = None;
    'drain: for task in &mut tasks {
        loop {
            tokio::select! {
                note = task.notifier.recv() => match note {
                    Some(err) => {
                        warn!(%backend, stream = %task.stream, error = %err, "stream failed");
                        failures.push(task.stream, err.to_string());
                    }
                    None => break,
                },
                err = watchdog.expired() => {
                    expired = Some(err);
                    break 'drain;
                }
            }
        }
    }
    if expired.is_some() {
        for task in &tasks {
            task.handle.abort();
        }
    }

    let waited = session.wait().await;
    let duration = started.elapsed();
    debug!(%backend, ?duration, "command finished");

    if let Some(err) = expired {
        return Err(err);
    }
    watchdog.finish().await?;
    if !failures.is_empty() {
        return Err(ExecError::Streams(failures));
    }
    let code = waited?;

    Ok(Completion { code, duration })
}
