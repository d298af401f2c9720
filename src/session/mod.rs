//! Conversation flow over a supervised backend.

pub mod conversation;
pub mod waiter;

pub use conversation::{
    estimate_tokens, ChatOptions, ContextSnapshot, ConversationSession, ConversationState, ImportMode, Turn,
};
pub use waiter::{
    contains_marker, Completion, CompletionDetector, Deadline, MarkerDetector, Reply, ResponseWaiter, WaitPolicy,
    DEFAULT_COMPLETION_MARKERS, DEFAULT_STREAM_END_MARKERS,
};
