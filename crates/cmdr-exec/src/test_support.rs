//! Test doubles shared by unit tests

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::sync::Notify;

use crate::error::ExecError;
use crate::stream::{StreamKind, pipe_open_error};
use crate::traits::{BackendKind, PipeReader, PipeWriter, Session, Terminate};

/// Yields its data, then fails every read
pub(crate) struct FailingReader {
    data: Vec<u8>,
    pos: usize,
    message: &'static str,
}

impl FailingReader {
    pub(crate) fn new(data: &[u8], message: &'static str) -> Self {
        Self {
            data: data.to_vec(),
            pos: 0,
            message,
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.data.len() {
            let n = buf.remaining().min(self.data.len() - self.pos);
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Poll::Ready(Err(io::Error::other(self.message)))
    }
}

/// Counts terminate calls and wakes anyone waiting on `killed`
#[derive(Default)]
pub(crate) struct CountingTerminator {
    calls: AtomicUsize,
    pub(crate) killed: Notify,
}

impl CountingTerminator {
    pub(crate) fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Terminate for CountingTerminator {
    async fn terminate(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.killed.notify_one();
    }
}

/// Scripted backend for orchestrator tests
///
/// Output pipes are handed out as configured; `wait` returns `exit_code`,
/// or blocks until terminated when `hang` is set.
pub(crate) struct MockSession {
    pub(crate) stdout: Option<PipeReader>,
    pub(crate) stderr: Option<PipeReader>,
    pub(crate) stdin: Option<DuplexStream>,
    pub(crate) fail_open: Option<StreamKind>,
    pub(crate) fail_start: bool,
    pub(crate) hang: bool,
    pub(crate) exit_code: Option<i32>,
    pub(crate) started_with: Option<Option<String>>,
    pub(crate) waited: usize,
    pub(crate) terminator: Arc<CountingTerminator>,
}

impl Default for MockSession {
    fn default() -> Self {
        Self {
            stdout: None,
            stderr: None,
            stdin: None,
            fail_open: None,
            fail_start: false,
            hang: false,
            exit_code: Some(0),
            started_with: None,
            waited: 0,
            terminator: Arc::new(CountingTerminator::default()),
        }
    }
}

impl MockSession {
    fn check_open(&self, stream: StreamKind) -> Result<(), ExecError> {
        if self.fail_open == Some(stream) {
            return Err(pipe_open_error(stream, "no such pipe"));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MockSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn open_stdin(&mut self) -> Result<PipeWriter, ExecError> {
        self.check_open(StreamKind::Stdin)?;
        let (writer, reader) = tokio::io::duplex(1024);
        self.stdin = Some(reader);
        Ok(Box::new(writer))
    }

    fn open_stdout(&mut self) -> Result<PipeReader, ExecError> {
        self.check_open(StreamKind::Stdout)?;
        Ok(self.stdout.take().unwrap_or_else(|| Box::new(tokio::io::empty())))
    }

    fn open_stderr(&mut self) -> Result<PipeReader, ExecError> {
        self.check_open(StreamKind::Stderr)?;
        Ok(self.stderr.take().unwrap_or_else(|| Box::new(tokio::io::empty())))
    }

    async fn start(&mut self, command: Option<&str>) -> Result<(), ExecError> {
        self.started_with = Some(command.map(str::to_string));
        if self.fail_start {
            return Err(ExecError::Start("mock refused to start".into()));
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<Option<i32>, ExecError> {
        self.waited += 1;
        if self.hang && self.terminator.count() == 0 {
            self.terminator.killed.notified().await;
            return Ok(None);
        }
        Ok(self.exit_code)
    }

    fn terminator(&self) -> Arc<dyn Terminate> {
        self.terminator.clone()
    }
}
