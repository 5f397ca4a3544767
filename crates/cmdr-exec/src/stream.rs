//! Stream processors moving bytes between stdio pipes and message channels

use std::fmt;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::ExecError;

/// One of the three stdio streams of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdin => f.write_str("stdin"),
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// How an output stream is split into channel items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Items end with (and include) the delimiter byte
    Delimited(u8),
    /// Items are exactly this many bytes; the last one may be shorter
    Fixed(usize),
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Delimited(b'\n')
    }
}

impl Framing {
    /// Build a framing from a maximum chunk size and a delimiter byte
    ///
    /// A non-zero `max_bytes` selects fixed-size chunks. Otherwise items are
    /// split on `delimiter`, where `0` means newline.
    #[must_use]
    pub fn from_parts(max_bytes: usize, delimiter: u8) -> Self {
        if max_bytes > 0 {
            Framing::Fixed(max_bytes)
        } else if delimiter == 0 {
            Framing::Delimited(b'\n')
        } else {
            Framing::Delimited(delimiter)
        }
    }

    /// A zero chunk size means delimiter framing on newline, as in
    /// [`Framing::from_parts`]
    fn normalized(self) -> Self {
        match self {
            Framing::Fixed(0) => Framing::default(),
            other => other,
        }
    }
}

/// Splits a byte stream into frames
pub(crate) struct FrameReader<R> {
    reader: BufReader<R>,
    framing: Framing,
    finished: bool,
    pending: Option<io::Error>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader: BufReader::new(reader),
            framing: framing.normalized(),
            finished: false,
            pending: None,
        }
    }

    /// Read the next frame, `None` once the stream is exhausted
    ///
    /// Bytes read before a failure are returned as a frame of their own and
    /// the failure is reported by the following call.
    pub(crate) async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if let Some(err) = self.pending.take() {
            self.finished = true;
            return Err(err);
        }
        if self.finished {
            return Ok(None);
        }

        let mut frame = Vec::new();
        let result = match self.framing {
            Framing::Delimited(delim) => self.read_delimited(delim, &mut frame).await,
            Framing::Fixed(size) => self.read_fixed(size, &mut frame).await,
        };

        match result {
            Ok(()) if frame.is_empty() => {
                self.finished = true;
                Ok(None)
            }
            Ok(()) => Ok(Some(frame)),
            Err(err) if !frame.is_empty() => {
                self.pending = Some(err);
                Ok(Some(frame))
            }
            Err(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    async fn read_delimited(&mut self, delim: u8, frame: &mut Vec<u8>) -> io::Result<()> {
        self.reader.read_until(delim, frame).await?;
        if frame.last() != Some(&delim) {
            // unterminated remainder: the stream ended
            self.finished = true;
        }
        Ok(())
    }

    async fn read_fixed(&mut self, size: usize, frame: &mut Vec<u8>) -> io::Result<()> {
        let mut chunk = vec![0u8; size];
        let mut filled = 0;
        let result = loop {
            if filled == chunk.len() {
                break Ok(());
            }
            match self.reader.read(&mut chunk[filled..]).await {
                Ok(0) => {
                    self.finished = true;
                    break Ok(());
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(err),
            }
        };
        frame.extend_from_slice(&chunk[..filled]);
        result
    }
}

/// End of data is normal termination, never a stream failure
fn is_end_of_data(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}

/// Feed items from `input` into `pipe` until the input channel closes
///
/// A failed write is reported on `notifier` and the next item is still
/// attempted. The pipe is shut down once the channel closes so the command
/// sees end of input; dropping `notifier` tells the orchestrator this task
/// is done.
pub async fn pump_input<W>(
    mut input: mpsc::Receiver<String>,
    notifier: mpsc::Sender<io::Error>,
    mut pipe: W,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = input.recv().await {
        trace!(bytes = item.len(), "writing stdin item");
        if let Err(err) = write_item(&mut pipe, item.as_bytes()).await {
            debug!(error = %err, "stdin write failed");
            if notifier.send(err).await.is_err() {
                break;
            }
        }
    }

    let _ = pipe.shutdown().await;
    debug!("stdin channel closed");
}

async fn write_item<W: AsyncWrite + Unpin>(pipe: &mut W, bytes: &[u8]) -> io::Result<()> {
    pipe.write_all(bytes).await?;
    pipe.flush().await
}

/// Read frames from `pipe` and forward every non-empty one to `output`
///
/// Stops at end of data or on the first read error; only the latter is
/// reported on `notifier`. Both channels are closed when this returns. If
/// the output receiver goes away, frames are discarded but the pipe is
/// still drained so the command never blocks on a full pipe.
pub async fn pump_output<R>(
    pipe: R,
    output: mpsc::Sender<String>,
    notifier: mpsc::Sender<io::Error>,
    framing: Framing,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(pipe, framing);
    let mut discarding = false;

    loop {
        match frames.next_frame().await {
            Ok(Some(frame)) => {
                if frame.is_empty() || discarding {
                    continue;
                }
                let item = String::from_utf8_lossy(&frame).into_owned();
                if output.send(item).await.is_err() {
                    debug!("output receiver dropped, discarding remaining frames");
                    discarding = true;
                }
            }
            Ok(None) => break,
            Err(err) if is_end_of_data(&err) => break,
            Err(err) => {
                debug!(error = %err, "output read failed");
                let _ = notifier.send(err).await;
                break;
            }
        }
    }
}

/// Error for a stdio pipe that could not be opened
pub(crate) fn pipe_open_error(stream: StreamKind, err: impl fmt::Display) -> ExecError {
    ExecError::PipeOpen {
        stream,
        reason: err.to_string(),
    }
}
