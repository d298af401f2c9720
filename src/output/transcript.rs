//! Where a conversation is shown as it happens.

use std::time::Duration;

/// Receives the visible parts of a conversation.
///
/// Every method defaults to doing nothing so sinks only implement what they
/// display.
pub trait TranscriptSink: Send + Sync {
    /// A note from the client itself (startup, reset, system prompt).
    fn system(&self, _text: &str) {}

    fn user(&self, _prompt: &str) {}

    /// Generated text as it streams in.
    fn assistant_fragment(&self, _text: &str) {}

    /// Reasoning the model wrapped in thinking tags, as it streams in.
    fn thinking_fragment(&self, _text: &str) {}

    /// The final assistant text for one exchange.
    fn assistant_done(&self, _text: &str) {}

    fn error(&self, _message: &str) {}

    fn timing(&self, _elapsed: Duration, _chars: usize) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTranscript;

impl TranscriptSink for NullTranscript {}
