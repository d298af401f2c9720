//! Bounded wait for the outcome of one command.
//!
//! The backend answers a chat with two success lines on stderr: a status
//! saying generation finished, then a line carrying the full response. A
//! chat is only settled once both are read, or once the second fails to show
//! within a short window. A line that still arrives after that belongs to
//! the earlier chat and is dropped by whichever exchange sees it.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{DiagnosticSource, LineRead, Liveness, StreamEvent};
use crate::error::ChatError;
use crate::output::TranscriptSink;
use crate::protocol::{decode, split_thinking, Command, Segment, StatusMessage, ThinkingSplitter, ThinkingTags};

/// Markers that settle a chat on their own.
pub const DEFAULT_COMPLETION_MARKERS: &[&str] = &["完整响应已生成", "完成"];

/// Markers saying generation finished; the full response line may follow.
pub const DEFAULT_STREAM_END_MARKERS: &[&str] = &["流式输出完成", "Streaming completed"];

/// Extra stream polls allowed after completion for the end marker to arrive.
const SETTLE_POLLS: u32 = 5;

/// Stale lines are drained with this short wait before each send.
const STALE_WAIT: Duration = Duration::from_millis(10);

/// Stand-in used to classify lines left over from an earlier chat.
const EARLIER_CHAT: Command = Command::Chat {
    prompt: String::new(),
    max_new_tokens: None,
};

/// How far a success message takes the outstanding command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Not an answer to this command.
    Pending,
    /// Generation finished; a line with the full response may still follow.
    Streamed,
    /// The command is settled.
    Final,
}

/// Decides what a success message means for the outstanding command.
pub trait CompletionDetector: Send + Sync {
    fn classify(&self, command: &Command, message: &str, has_response: bool) -> Completion;
}

/// Classifies chat replies by marker; any success settles every other
/// command.
///
/// Markers match whole words only: `完成` matches `done 完成` but not
/// `加载完成`.
#[derive(Debug, Clone)]
pub struct MarkerDetector {
    completion: Vec<String>,
    stream_end: Vec<String>,
}

impl MarkerDetector {
    pub fn new(completion: Vec<String>, stream_end: Vec<String>) -> Self {
        Self {
            completion,
            stream_end,
        }
    }

    pub fn completion_markers(&self) -> &[String] {
        &self.completion
    }

    pub fn stream_end_markers(&self) -> &[String] {
        &self.stream_end
    }
}

impl Default for MarkerDetector {
    fn default() -> Self {
        Self::new(
            DEFAULT_COMPLETION_MARKERS.iter().map(|m| m.to_string()).collect(),
            DEFAULT_STREAM_END_MARKERS.iter().map(|m| m.to_string()).collect(),
        )
    }
}

impl CompletionDetector for MarkerDetector {
    fn classify(&self, command: &Command, message: &str, has_response: bool) -> Completion {
        if !matches!(command, Command::Chat { .. }) {
            return Completion::Final;
        }
        if has_response || self.completion.iter().any(|m| contains_marker(message, m)) {
            Completion::Final
        } else if self.stream_end.iter().any(|m| contains_marker(message, m)) {
            Completion::Streamed
        } else {
            Completion::Pending
        }
    }
}

/// True when `marker` occurs in `message` and is not glued to a letter or
/// digit on a side where the marker itself starts or ends with one.
pub fn contains_marker(message: &str, marker: &str) -> bool {
    if marker.is_empty() {
        return false;
    }
    let word_start = marker.chars().next().is_some_and(char::is_alphanumeric);
    let word_end = marker.chars().next_back().is_some_and(char::is_alphanumeric);

    message.match_indices(marker).any(|(index, _)| {
        let before = message[..index].chars().next_back();
        let after = message[index + marker.len()..].chars().next();
        !(word_start && before.is_some_and(char::is_alphanumeric))
            && !(word_end && after.is_some_and(char::is_alphanumeric))
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    /// Default bound on a whole exchange.
    pub timeout: Duration,
    /// Bound on each diagnostic read.
    pub poll_interval: Duration,
    /// How long a chat waits for the full response line after the backend
    /// says generation finished.
    pub response_settle: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            response_settle: Duration::from_secs(1),
        }
    }
}

/// A fixed point in time an exchange must finish by.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// The total allowance this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// The settled outcome of a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Reasoning the model wrapped in thinking tags, if any.
    pub thinking: Option<String>,
}

/// Completion lines still owed by an earlier chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Leftover {
    #[default]
    Nothing,
    /// The full response line of a chat answered without it.
    ResponseLine,
    /// Every completion line of a chat that timed out.
    Exchange,
}

struct StreamBuffer {
    answer: String,
    thinking: String,
    splitter: Option<ThinkingSplitter>,
    started: bool,
    ended: bool,
}

impl StreamBuffer {
    fn new(tags: Option<&ThinkingTags>) -> Self {
        Self {
            answer: String::new(),
            thinking: String::new(),
            splitter: tags.map(ThinkingSplitter::new),
            started: false,
            ended: false,
        }
    }

    fn absorb(&mut self, events: Vec<StreamEvent>, sink: &dyn TranscriptSink) {
        for event in events {
            self.push(event, sink);
        }
    }

    fn push(&mut self, event: StreamEvent, sink: &dyn TranscriptSink) {
        match event {
            StreamEvent::Started => self.started = true,
            StreamEvent::Fragment(text) => match self.splitter.as_mut() {
                Some(splitter) => {
                    let segments = splitter.push(&text);
                    self.emit(segments, sink);
                }
                None => self.emit(vec![Segment::Answer(text)], sink),
            },
            StreamEvent::Ended => self.ended = true,
        }
    }

    fn emit(&mut self, segments: Vec<Segment>, sink: &dyn TranscriptSink) {
        for segment in segments {
            match segment {
                Segment::Answer(text) => {
                    sink.assistant_fragment(&text);
                    self.answer.push_str(&text);
                }
                Segment::Thinking(text) => {
                    sink.thinking_fragment(&text);
                    self.thinking.push_str(&text);
                }
            }
        }
    }

    /// Pick the reply text: the response payload, else the streamed answer,
    /// else the completion message.
    fn finish(
        mut self,
        response: Option<String>,
        message: String,
        tags: Option<&ThinkingTags>,
        sink: &dyn TranscriptSink,
    ) -> Reply {
        if let Some(segments) = self.splitter.as_mut().map(ThinkingSplitter::finish) {
            self.emit(segments, sink);
        }

        let mut thinking = self.thinking.trim().to_string();
        let response = match (response, tags) {
            (Some(response), Some(tags)) => {
                let (answer, reasoning) = split_thinking(tags, &response);
                if thinking.is_empty() {
                    thinking = reasoning.trim().to_string();
                }
                Some(answer.trim().to_string()).filter(|a| !a.is_empty())
            }
            (response, _) => response,
        };

        Reply {
            text: final_text(response, self.answer, message),
            thinking: Some(thinking).filter(|t| !t.is_empty()),
        }
    }
}

pub struct ResponseWaiter {
    policy: WaitPolicy,
    detector: Box<dyn CompletionDetector>,
    thinking: Option<ThinkingTags>,
    leftover: Leftover,
}

impl ResponseWaiter {
    pub fn new(policy: WaitPolicy, detector: Box<dyn CompletionDetector>) -> Self {
        Self {
            policy,
            detector,
            thinking: None,
            leftover: Leftover::Nothing,
        }
    }

    /// Separate tagged reasoning from the answer in chat replies.
    pub fn with_thinking(mut self, tags: ThinkingTags) -> Self {
        self.thinking = Some(tags);
        self
    }

    pub fn policy(&self) -> WaitPolicy {
        self.policy
    }

    /// Deadline for one exchange; `timeout` overrides the policy default.
    pub fn deadline(&self, timeout: Option<Duration>) -> Deadline {
        Deadline::after(timeout.unwrap_or(self.policy.timeout))
    }

    /// Wait for `command` to settle before `deadline`.
    pub async fn wait<S>(
        &mut self,
        source: &mut S,
        command: &Command,
        deadline: Deadline,
        sink: &dyn TranscriptSink,
    ) -> Result<Reply, ChatError>
    where
        S: DiagnosticSource + ?Sized,
    {
        let poll = self.policy.poll_interval;
        let mut buffer = StreamBuffer::new(self.thinking.as_ref());

        loop {
            buffer.absorb(source.drain_stream(), sink);

            let remaining = deadline.remaining();
            if remaining.is_zero() {
                if matches!(command, Command::Chat { .. }) {
                    self.leftover = Leftover::Exchange;
                }
                return Err(ChatError::ResponseTimeout(deadline.budget()));
            }
            let wait = poll.min(remaining);

            match source.next_line(wait).await {
                Ok(LineRead::Line(line)) => match decode(&line) {
                    Some(StatusMessage::Success { message, response }) => {
                        if self.drop_leftover(&message, response.is_some()) {
                            debug!("dropping completion of an earlier chat: {message}");
                            continue;
                        }
                        match self.detector.classify(command, &message, response.is_some()) {
                            Completion::Final => {
                                self.settle(source, &mut buffer, sink).await;
                                return Ok(buffer.finish(response, message, self.thinking.as_ref(), sink));
                            }
                            Completion::Streamed => {
                                let response = self.await_response(source, &mut buffer, deadline, sink).await;
                                self.settle(source, &mut buffer, sink).await;
                                return Ok(buffer.finish(response, message, self.thinking.as_ref(), sink));
                            }
                            Completion::Pending => info!(target: "pipechat::backend", "{message}"),
                        }
                    }
                    Some(StatusMessage::Error { message }) => {
                        if self.leftover == Leftover::Exchange {
                            debug!("dropping error from an earlier chat: {message}");
                            self.leftover = Leftover::Nothing;
                            continue;
                        }
                        error!(target: "pipechat::backend", "{message}");
                        return Err(ChatError::BackendReportedError(message));
                    }
                    Some(StatusMessage::Progress { message }) => {
                        info!(target: "pipechat::backend", "{message}");
                    }
                    Some(StatusMessage::Ready) => {
                        debug!("ready status while waiting on {}", command.kind());
                    }
                    None => debug!(target: "pipechat::backend::stderr", "{line}"),
                },
                Ok(LineRead::Idle) => {
                    if let Liveness::Exited(code) = source.liveness() {
                        return Err(ChatError::ProcessExited(code));
                    }
                }
                Ok(LineRead::Closed) | Err(_) => {
                    if let Liveness::Exited(code) = source.liveness() {
                        return Err(ChatError::ProcessExited(code));
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// After the generation-finished status, read on for the line carrying
    /// the full response. Gives up after `response_settle` or at `deadline`.
    async fn await_response<S>(
        &mut self,
        source: &mut S,
        buffer: &mut StreamBuffer,
        deadline: Deadline,
        sink: &dyn TranscriptSink,
    ) -> Option<String>
    where
        S: DiagnosticSource + ?Sized,
    {
        let window = Deadline::after(self.policy.response_settle.min(deadline.remaining()));

        loop {
            buffer.absorb(source.drain_stream(), sink);

            let remaining = window.remaining();
            if remaining.is_zero() {
                debug!("full response line not seen before settle window closed");
                self.leftover = Leftover::ResponseLine;
                return None;
            }
            let wait = self.policy.poll_interval.min(remaining);

            match source.next_line(wait).await {
                Ok(LineRead::Line(line)) => match decode(&line) {
                    Some(StatusMessage::Success { message, response }) => {
                        let has_response = response.is_some();
                        if self.detector.classify(&EARLIER_CHAT, &message, has_response) == Completion::Final {
                            return response;
                        }
                        info!(target: "pipechat::backend", "{message}");
                    }
                    Some(StatusMessage::Error { message }) => {
                        warn!(target: "pipechat::backend", "error after generation finished: {message}");
                        return None;
                    }
                    Some(StatusMessage::Progress { message }) => {
                        info!(target: "pipechat::backend", "{message}");
                    }
                    Some(StatusMessage::Ready) => {}
                    None => debug!(target: "pipechat::backend::stderr", "{line}"),
                },
                Ok(LineRead::Idle) => {
                    if source.liveness() != Liveness::Alive {
                        return None;
                    }
                }
                Ok(LineRead::Closed) | Err(_) => {
                    if source.liveness() != Liveness::Alive {
                        return None;
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Give the stdout stream a short window to deliver its end marker.
    async fn settle<S>(&self, source: &mut S, buffer: &mut StreamBuffer, sink: &dyn TranscriptSink)
    where
        S: DiagnosticSource + ?Sized,
    {
        buffer.absorb(source.drain_stream(), sink);
        if !buffer.started || buffer.ended {
            return;
        }

        for _ in 0..SETTLE_POLLS {
            if let Some(event) = source.next_stream_event(self.policy.poll_interval).await {
                buffer.push(event, sink);
                buffer.absorb(source.drain_stream(), sink);
                if buffer.ended {
                    return;
                }
            }
        }
        trace!("stream end marker not seen before settle window closed");
    }

    /// True when a success line is owed by an earlier chat rather than the
    /// current command.
    ///
    /// The backend handles one command at a time, so whatever an earlier chat
    /// still owes arrives before any reply to the next command.
    fn drop_leftover(&mut self, message: &str, has_response: bool) -> bool {
        let completion = self.detector.classify(&EARLIER_CHAT, message, has_response);
        match (self.leftover, completion) {
            (Leftover::Nothing, _) | (_, Completion::Pending) => false,
            (Leftover::ResponseLine, Completion::Final) => {
                self.leftover = Leftover::Nothing;
                true
            }
            // The owed line never came; this one is the current chat's.
            (Leftover::ResponseLine, Completion::Streamed) => {
                self.leftover = Leftover::Nothing;
                false
            }
            (Leftover::Exchange, Completion::Streamed) => {
                self.leftover = Leftover::ResponseLine;
                true
            }
            (Leftover::Exchange, Completion::Final) => {
                self.leftover = Leftover::Nothing;
                true
            }
        }
    }

    /// Drop status lines and stream events left over from earlier exchanges.
    ///
    /// Reads for at most one poll interval, and never past `deadline`, so a
    /// backend that keeps printing cannot hold up the next send.
    pub async fn discard_stale<S>(&mut self, source: &mut S, deadline: Deadline) -> usize
    where
        S: DiagnosticSource + ?Sized,
    {
        let window = Deadline::after(self.policy.poll_interval.min(deadline.remaining()));
        let mut discarded = 0;

        loop {
            let remaining = window.remaining();
            if remaining.is_zero() {
                break;
            }
            match source.next_line(STALE_WAIT.min(remaining)).await {
                Ok(LineRead::Line(line)) => {
                    debug!("discarding stale backend output: {line}");
                    match decode(&line) {
                        Some(StatusMessage::Success { message, response }) => {
                            self.drop_leftover(&message, response.is_some());
                        }
                        Some(StatusMessage::Error { .. }) if self.leftover == Leftover::Exchange => {
                            self.leftover = Leftover::Nothing;
                        }
                        _ => {}
                    }
                    discarded += 1;
                }
                _ => break,
            }
        }

        let events = source.drain_stream();
        if !events.is_empty() {
            debug!(count = events.len(), "discarding stale stream events");
        }
        discarded + events.len()
    }
}

fn final_text(response: Option<String>, streamed: String, message: String) -> String {
    if let Some(response) = response {
        return response;
    }
    let streamed = streamed.trim();
    if !streamed.is_empty() {
        return streamed.to_string();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    enum Step {
        Line(&'static str),
        Stream(StreamEvent),
        Exit(Option<i32>),
    }

    struct Scripted {
        steps: VecDeque<Step>,
        stream: VecDeque<StreamEvent>,
        liveness: Liveness,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                stream: VecDeque::new(),
                liveness: Liveness::Alive,
            }
        }
    }

    #[async_trait]
    impl DiagnosticSource for Scripted {
        async fn next_line(&mut self, wait: Duration) -> io::Result<LineRead> {
            match self.steps.pop_front() {
                Some(Step::Line(line)) => Ok(LineRead::Line(line.to_string())),
                Some(Step::Stream(event)) => {
                    self.stream.push_back(event);
                    Ok(LineRead::Idle)
                }
                Some(Step::Exit(code)) => {
                    self.liveness = Liveness::Exited(code);
                    Ok(LineRead::Closed)
                }
                None => {
                    tokio::time::sleep(wait).await;
                    Ok(LineRead::Idle)
                }
            }
        }

        async fn next_stream_event(&mut self, wait: Duration) -> Option<StreamEvent> {
            if let Some(event) = self.stream.pop_front() {
                return Some(event);
            }
            if matches!(self.steps.front(), Some(Step::Stream(_))) {
                if let Some(Step::Stream(event)) = self.steps.pop_front() {
                    return Some(event);
                }
            }
            tokio::time::sleep(wait).await;
            None
        }

        fn drain_stream(&mut self) -> Vec<StreamEvent> {
            self.stream.drain(..).collect()
        }

        fn liveness(&mut self) -> Liveness {
            self.liveness
        }
    }

    /// Prints a noise line every millisecond, forever.
    struct Chatty;

    #[async_trait]
    impl DiagnosticSource for Chatty {
        async fn next_line(&mut self, _wait: Duration) -> io::Result<LineRead> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(LineRead::Line("loading shard".to_string()))
        }

        async fn next_stream_event(&mut self, wait: Duration) -> Option<StreamEvent> {
            tokio::time::sleep(wait).await;
            None
        }

        fn drain_stream(&mut self) -> Vec<StreamEvent> {
            Vec::new()
        }

        fn liveness(&mut self) -> Liveness {
            Liveness::Alive
        }
    }

    #[derive(Default)]
    struct Recording {
        fragments: Mutex<Vec<String>>,
        thinking: Mutex<Vec<String>>,
    }

    impl TranscriptSink for Recording {
        fn assistant_fragment(&self, text: &str) {
            self.fragments.lock().unwrap().push(text.to_string());
        }

        fn thinking_fragment(&self, text: &str) {
            self.thinking.lock().unwrap().push(text.to_string());
        }
    }

    const STREAM_DONE: &str = r#"{"type":"status","status":"success","message":"流式输出完成"}"#;

    fn waiter(timeout_ms: u64) -> ResponseWaiter {
        ResponseWaiter::new(
            WaitPolicy {
                timeout: Duration::from_millis(timeout_ms),
                poll_interval: Duration::from_millis(10),
                response_settle: Duration::from_millis(50),
            },
            Box::new(MarkerDetector::default()),
        )
    }

    async fn chat(waiter: &mut ResponseWaiter, source: &mut Scripted) -> Result<Reply, ChatError> {
        let deadline = waiter.deadline(None);
        waiter
            .wait(source, &Command::chat("hi"), deadline, &Recording::default())
            .await
    }

    fn fragment(text: &str) -> Step {
        Step::Stream(StreamEvent::Fragment(text.to_string()))
    }

    #[tokio::test]
    async fn noise_then_marker_success_completes_chat() {
        let mut source = Scripted::new(vec![
            Step::Line("noise"),
            Step::Line(r#"{"type":"status","status":"success","message":"done 完成"}"#),
        ]);
        let reply = chat(&mut waiter(1000), &mut source).await.unwrap();
        assert_eq!(reply.text, "done 完成");
        assert_eq!(reply.thinking, None);
    }

    #[tokio::test]
    async fn streamed_fragments_are_returned_and_forwarded() {
        let mut source = Scripted::new(vec![
            Step::Stream(StreamEvent::Started),
            fragment("Hello, "),
            fragment("world"),
            Step::Line(r#"{"type":"status","status":"processing","message":"generating"}"#),
            Step::Stream(StreamEvent::Ended),
            Step::Line(r#"{"type":"status","status":"success","message":"Streaming completed"}"#),
        ]);
        let sink = Recording::default();
        let mut waiter = waiter(1000);
        let deadline = waiter.deadline(None);
        let reply = waiter
            .wait(&mut source, &Command::chat("hi"), deadline, &sink)
            .await
            .unwrap();
        assert_eq!(reply.text, "Hello, world");
        assert_eq!(*sink.fragments.lock().unwrap(), vec!["Hello, ", "world"]);
    }

    #[tokio::test]
    async fn late_fragments_are_picked_up_while_settling() {
        let mut source = Scripted::new(vec![
            Step::Stream(StreamEvent::Started),
            fragment("early "),
            Step::Line(STREAM_DONE),
            fragment("late"),
            Step::Stream(StreamEvent::Ended),
        ]);
        let reply = chat(&mut waiter(1000), &mut source).await.unwrap();
        assert_eq!(reply.text, "early late");
    }

    #[tokio::test]
    async fn response_payload_wins_over_fragments() {
        let mut source = Scripted::new(vec![
            fragment("partial"),
            Step::Line(
                r#"{"type":"response","status":"success","message":"完整响应已生成","response":"The full answer"}"#,
            ),
        ]);
        let reply = chat(&mut waiter(1000), &mut source).await.unwrap();
        assert_eq!(reply.text, "The full answer");
    }

    #[tokio::test]
    async fn response_line_after_stream_end_status_is_used() {
        let mut source = Scripted::new(vec![
            Step::Line(STREAM_DONE),
            Step::Line("trailing noise"),
            Step::Line(
                r#"{"type":"response","status":"success","message":"完整响应已生成","response":"The real answer"}"#,
            ),
        ]);
        let mut waiter = waiter(1000);
        let reply = chat(&mut waiter, &mut source).await.unwrap();
        assert_eq!(reply.text, "The real answer");
        assert!(source.steps.is_empty());
        assert_eq!(waiter.leftover, Leftover::Nothing);
    }

    #[tokio::test]
    async fn late_response_line_is_not_credited_to_next_chat() {
        let mut waiter = waiter(1000);

        let mut source = Scripted::new(vec![Step::Line(STREAM_DONE)]);
        let first = chat(&mut waiter, &mut source).await.unwrap();
        assert_eq!(first.text, "流式输出完成");
        assert_eq!(waiter.leftover, Leftover::ResponseLine);

        source.steps.extend([
            Step::Line(r#"{"type":"response","status":"success","message":"完整响应已生成","response":"answer 1"}"#),
            Step::Line(STREAM_DONE),
            Step::Line(r#"{"type":"response","status":"success","message":"完整响应已生成","response":"answer 2"}"#),
        ]);
        let second = chat(&mut waiter, &mut source).await.unwrap();
        assert_eq!(second.text, "answer 2");
        assert_eq!(waiter.leftover, Leftover::Nothing);
    }

    #[tokio::test]
    async fn missing_response_line_does_not_swallow_next_reply() {
        let mut waiter = waiter(1000);
        let mut source = Scripted::new(vec![Step::Line(
            r#"{"type":"status","status":"success","message":"Streaming completed"}"#,
        )]);
        chat(&mut waiter, &mut source).await.unwrap();
        assert_eq!(waiter.leftover, Leftover::ResponseLine);

        source.steps.extend([
            Step::Stream(StreamEvent::Started),
            fragment("second reply"),
            Step::Stream(StreamEvent::Ended),
            Step::Line(r#"{"type":"status","status":"success","message":"Streaming completed"}"#),
        ]);
        let reply = chat(&mut waiter, &mut source).await.unwrap();
        assert_eq!(reply.text, "second reply");
    }

    #[tokio::test]
    async fn timed_out_chat_output_is_skipped_later() {
        let mut waiter = waiter(1000);
        let mut source = Scripted::new(vec![]);
        let deadline = Deadline::after(Duration::from_millis(30));
        let err = waiter
            .wait(&mut source, &Command::chat("slow"), deadline, &Recording::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ResponseTimeout(_)));

        source.steps.extend([
            Step::Line(STREAM_DONE),
            Step::Line(r#"{"type":"response","status":"success","message":"完整响应已生成","response":"stale"}"#),
            Step::Line(STREAM_DONE),
            Step::Line(r#"{"type":"response","status":"success","message":"完整响应已生成","response":"fresh"}"#),
        ]);
        let reply = chat(&mut waiter, &mut source).await.unwrap();
        assert_eq!(reply.text, "fresh");
    }

    #[tokio::test]
    async fn progress_wording_does_not_end_chat() {
        let mut source = Scripted::new(vec![
            Step::Line(r#"{"type":"status","status":"success","message":"加载完成"}"#),
            Step::Line(r#"{"type":"status","status":"success","message":"done 完成"}"#),
        ]);
        let reply = chat(&mut waiter(1000), &mut source).await.unwrap();
        assert_eq!(reply.text, "done 完成");
    }

    #[tokio::test]
    async fn chat_ignores_success_without_marker() {
        let mut source = Scripted::new(vec![
            Step::Line(r#"{"type":"message","status":"success","message":"prompt accepted"}"#),
            Step::Line(r#"{"type":"status","status":"success","message":"Streaming completed"}"#),
        ]);
        let reply = chat(&mut waiter(1000), &mut source).await.unwrap();
        assert_eq!(reply.text, "Streaming completed");
    }

    #[tokio::test]
    async fn thinking_is_split_from_streamed_answer() {
        let mut source = Scripted::new(vec![
            Step::Stream(StreamEvent::Started),
            fragment("<think"),
            fragment("ing>check units</thinking>"),
            fragment("42 km"),
            Step::Stream(StreamEvent::Ended),
            Step::Line(r#"{"type":"status","status":"success","message":"done 完成"}"#),
        ]);
        let sink = Recording::default();
        let mut waiter = waiter(1000).with_thinking(ThinkingTags::default());
        let deadline = waiter.deadline(None);
        let reply = waiter
            .wait(&mut source, &Command::chat("hi"), deadline, &sink)
            .await
            .unwrap();
        assert_eq!(reply.text, "42 km");
        assert_eq!(reply.thinking.as_deref(), Some("check units"));
        assert_eq!(*sink.thinking.lock().unwrap(), vec!["check units"]);
        assert_eq!(*sink.fragments.lock().unwrap(), vec!["42 km"]);
    }

    #[tokio::test]
    async fn thinking_tags_are_removed_from_response_payload() {
        let mut source = Scripted::new(vec![Step::Line(
            r#"{"type":"response","status":"success","message":"完整响应已生成","response":"【思考】先算【/思考】\n结果是4"}"#,
        )]);
        let mut waiter = waiter(1000).with_thinking(ThinkingTags::default());
        let reply = chat(&mut waiter, &mut source).await.unwrap();
        assert_eq!(reply.text, "结果是4");
        assert_eq!(reply.thinking.as_deref(), Some("先算"));
    }

    #[tokio::test]
    async fn system_prompt_completes_on_any_success() {
        let mut source = Scripted::new(vec![Step::Line(
            r#"{"type":"message","status":"success","message":"system prompt set"}"#,
        )]);
        let command = Command::SystemPrompt {
            text: "be brief".to_string(),
        };
        let mut waiter = waiter(1000);
        let deadline = waiter.deadline(None);
        let reply = waiter
            .wait(&mut source, &command, deadline, &Recording::default())
            .await
            .unwrap();
        assert_eq!(reply.text, "system prompt set");
    }

    #[tokio::test]
    async fn error_status_is_propagated() {
        let mut source = Scripted::new(vec![Step::Line(
            r#"{"type":"error","status":"error","message":"context overflow"}"#,
        )]);
        let err = chat(&mut waiter(1000), &mut source).await.unwrap_err();
        assert!(matches!(err, ChatError::BackendReportedError(ref m) if m == "context overflow"));
    }

    #[tokio::test]
    async fn process_exit_is_detected() {
        let mut source = Scripted::new(vec![Step::Line("working"), Step::Exit(Some(139))]);
        let err = chat(&mut waiter(1000), &mut source).await.unwrap_err();
        assert!(matches!(err, ChatError::ProcessExited(Some(139))));
    }

    #[tokio::test]
    async fn silence_times_out() {
        let mut source = Scripted::new(vec![]);
        let started = std::time::Instant::now();
        let mut waiter = waiter(60_000);
        let deadline = waiter.deadline(Some(Duration::from_millis(80)));
        let err = waiter
            .wait(&mut source, &Command::chat("hi"), deadline, &Recording::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ResponseTimeout(d) if d == Duration::from_millis(80)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn endless_noise_still_times_out_on_schedule() {
        let mut waiter = waiter(60_000);
        let started = std::time::Instant::now();
        let deadline = waiter.deadline(Some(Duration::from_millis(150)));

        let discarded = waiter.discard_stale(&mut Chatty, deadline).await;
        assert!(discarded > 0);
        let err = waiter
            .wait(&mut Chatty, &Command::chat("hi"), deadline, &Recording::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ResponseTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn discard_stale_drops_buffered_output() {
        let mut source = Scripted::new(vec![
            Step::Line(r#"{"type":"status","status":"success","message":"old 完成"}"#),
            Step::Line("old noise"),
        ]);
        source.stream.push_back(StreamEvent::Fragment("old".into()));

        let mut waiter = waiter(1000);
        let deadline = waiter.deadline(None);
        let discarded = waiter.discard_stale(&mut source, deadline).await;
        assert_eq!(discarded, 3);
        assert!(source.steps.is_empty());
        assert!(source.stream.is_empty());
    }

    #[tokio::test]
    async fn discarded_response_line_settles_what_was_owed() {
        let mut waiter = waiter(1000);
        waiter.leftover = Leftover::ResponseLine;
        let mut source = Scripted::new(vec![Step::Line(
            r#"{"type":"response","status":"success","message":"完整响应已生成","response":"old"}"#,
        )]);
        let deadline = waiter.deadline(None);
        waiter.discard_stale(&mut source, deadline).await;
        assert_eq!(waiter.leftover, Leftover::Nothing);
    }

    #[test]
    fn final_text_falls_back_to_message() {
        assert_eq!(final_text(None, "  \n".into(), "done".into()), "done");
        assert_eq!(final_text(None, "text\n".into(), "done".into()), "text");
        assert_eq!(final_text(Some("r".into()), "text".into(), "done".into()), "r");
    }

    #[test]
    fn markers_match_whole_words() {
        assert!(contains_marker("done 完成", "完成"));
        assert!(contains_marker("完成", "完成"));
        assert!(contains_marker("完成!", "完成"));
        assert!(!contains_marker("加载完成", "完成"));
        assert!(!contains_marker("流式输出完成", "完成"));
        assert!(contains_marker("流式输出完成", "流式输出完成"));
        assert!(contains_marker("Streaming completed.", "Streaming completed"));
        assert!(!contains_marker("Streaming completedness", "Streaming completed"));
        assert!(contains_marker("got<eos>", "<eos>"));
        assert!(!contains_marker("anything", ""));
    }

    #[test]
    fn marker_detector_classification() {
        let detector = MarkerDetector::default();
        let chat = Command::chat("x");
        assert_eq!(detector.classify(&chat, "流式输出完成", false), Completion::Streamed);
        assert_eq!(detector.classify(&chat, "完整响应已生成", true), Completion::Final);
        assert_eq!(detector.classify(&chat, "anything", true), Completion::Final);
        assert_eq!(detector.classify(&chat, "模型加载完成", false), Completion::Pending);
        assert_eq!(detector.classify(&Command::Reset, "anything", false), Completion::Final);

        let custom = MarkerDetector::new(vec!["<eos>".to_string()], Vec::new());
        assert_eq!(custom.classify(&chat, "got <eos>", false), Completion::Final);
        assert_eq!(custom.classify(&chat, "完成", false), Completion::Pending);
    }
}
