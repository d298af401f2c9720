//! Readers for the backend's output pipes.
//!
//! stderr carries status lines and is read on demand by whoever owns the
//! handle. stdout carries generated text and is drained continuously by a
//! background task so the backend never blocks on a full pipe.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::protocol::{split_stream_line, StreamPiece};

/// Outcome of one bounded attempt to read a diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    /// Nothing complete arrived within the wait.
    Idle,
    /// The pipe reached end of file.
    Closed,
}

/// Whether the backend process is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Exited(Option<i32>),
}

/// Generated-text events forwarded from stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Started,
    Fragment(String),
    Ended,
}

/// What the response waiter needs from a running backend.
#[async_trait]
pub trait DiagnosticSource: Send {
    /// Read one status line, waiting at most `wait`.
    async fn next_line(&mut self, wait: Duration) -> io::Result<LineRead>;

    /// Wait at most `wait` for the next stdout stream event.
    async fn next_stream_event(&mut self, wait: Duration) -> Option<StreamEvent>;

    /// Take every stream event already buffered, without waiting.
    fn drain_stream(&mut self) -> Vec<StreamEvent>;

    /// Non-blocking liveness poll.
    fn liveness(&mut self) -> Liveness;
}

/// Line reader over the diagnostic pipe.
///
/// Partial lines survive a timed-out read: bytes stay in `pending` until the
/// terminator arrives, so a line is never split or lost across polls.
pub struct DiagnosticReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    closed: bool,
}

impl<R: AsyncRead + Unpin + Send> DiagnosticReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
            closed: false,
        }
    }

    pub async fn read_line(&mut self, wait: Duration) -> io::Result<LineRead> {
        if self.closed {
            return Ok(LineRead::Closed);
        }

        let read = tokio::time::timeout(wait, self.reader.read_until(b'\n', &mut self.pending));
        match read.await {
            Err(_) => Ok(LineRead::Idle),
            Ok(Err(e)) => Err(e),
            Ok(Ok(0)) => {
                self.closed = true;
                if self.pending.is_empty() {
                    Ok(LineRead::Closed)
                } else {
                    Ok(LineRead::Line(self.take_line()))
                }
            }
            Ok(Ok(_)) => {
                if !self.pending.ends_with(b"\n") {
                    // read_until only stops short of the delimiter at EOF.
                    self.closed = true;
                }
                Ok(LineRead::Line(self.take_line()))
            }
        }
    }

    fn take_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&bytes);
        line.trim_end_matches(['\n', '\r']).to_string()
    }
}

/// Spawn the task that drains stdout and forwards stream events.
///
/// Text outside the stream markers is incidental output and only logged.
pub fn spawn_stream_forwarder<R>(stdout: R) -> (UnboundedReceiver<StreamEvent>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut streaming = false;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "backend stdout read failed");
                    break;
                }
            }

            let line = String::from_utf8_lossy(&buf);
            for piece in split_stream_line(&line) {
                let event = match piece {
                    StreamPiece::Start => {
                        streaming = true;
                        StreamEvent::Started
                    }
                    StreamPiece::End => {
                        streaming = false;
                        StreamEvent::Ended
                    }
                    StreamPiece::Text(text) if streaming => StreamEvent::Fragment(text),
                    StreamPiece::Text(text) => {
                        debug!(target: "pipechat::backend::stdout", "{}", text.trim_end());
                        continue;
                    }
                };
                if tx.send(event).is_err() {
                    trace!("stream receiver dropped, stopping stdout forwarder");
                    return;
                }
            }
        }
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn reads_lines_then_closes() {
        let mut reader = DiagnosticReader::new(&b"first\r\nsecond\n"[..]);
        assert_eq!(reader.read_line(WAIT).await.unwrap(), LineRead::Line("first".into()));
        assert_eq!(reader.read_line(WAIT).await.unwrap(), LineRead::Line("second".into()));
        assert_eq!(reader.read_line(WAIT).await.unwrap(), LineRead::Closed);
        assert_eq!(reader.read_line(WAIT).await.unwrap(), LineRead::Closed);
    }

    #[tokio::test]
    async fn unterminated_last_line_is_returned() {
        let mut reader = DiagnosticReader::new(&b"tail"[..]);
        assert_eq!(reader.read_line(WAIT).await.unwrap(), LineRead::Line("tail".into()));
        assert_eq!(reader.read_line(WAIT).await.unwrap(), LineRead::Closed);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let mut reader = DiagnosticReader::new(&b"ok \xff\xfe end\n"[..]);
        match reader.read_line(WAIT).await.unwrap() {
            LineRead::Line(line) => {
                assert!(line.starts_with("ok "));
                assert!(line.ends_with(" end"));
                assert!(line.contains('\u{FFFD}'));
            }
            other => panic!("expected a line, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_when_nothing_arrives() {
        let (_writer, read_half) = tokio::io::duplex(64);
        let mut reader = DiagnosticReader::new(read_half);
        let got = reader.read_line(Duration::from_millis(20)).await.unwrap();
        assert_eq!(got, LineRead::Idle);
    }

    #[tokio::test]
    async fn partial_line_survives_idle_poll() {
        use tokio::io::AsyncWriteExt;

        let (mut writer, read_half) = tokio::io::duplex(64);
        let mut reader = DiagnosticReader::new(read_half);

        writer.write_all(b"{\"status\":").await.unwrap();
        let got = reader.read_line(Duration::from_millis(20)).await.unwrap();
        assert_eq!(got, LineRead::Idle);

        writer.write_all(b"\"ready\"}\n").await.unwrap();
        let got = reader.read_line(WAIT).await.unwrap();
        assert_eq!(got, LineRead::Line("{\"status\":\"ready\"}".into()));
    }

    #[tokio::test]
    async fn forwarder_emits_only_marked_text() {
        let stdout: &'static [u8] =
            b"loading weights\n[LLM_STREAM_START]\nHello\nworld[LLM_STREAM_END]\nafter\n";
        let (mut rx, handle) = spawn_stream_forwarder(stdout);
        handle.await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::Started,
                StreamEvent::Fragment("Hello\n".into()),
                StreamEvent::Fragment("world".into()),
                StreamEvent::Ended,
            ]
        );
    }
}
