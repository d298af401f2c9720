//! Command and status types for the backend's stdio protocol.

use serde::{Deserialize, Serialize};

/// A request written to the backend's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Generate a reply to `prompt`, continuing the backend's own history.
    Chat {
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_new_tokens: Option<u32>,
    },
    /// Replace the system prompt used for subsequent chats.
    SystemPrompt {
        #[serde(rename = "system_prompt")]
        text: String,
    },
    /// Ask the backend to forget the conversation so far.
    Reset,
    /// Ask the backend to exit its request loop.
    Exit,
}

impl Command {
    /// A chat command without a token limit.
    pub fn chat(prompt: impl Into<String>) -> Self {
        Command::Chat {
            prompt: prompt.into(),
            max_new_tokens: None,
        }
    }

    /// Wire name of the command, as written in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Chat { .. } => "chat",
            Command::SystemPrompt { .. } => "system_prompt",
            Command::Reset => "reset",
            Command::Exit => "exit",
        }
    }
}

/// A status line read from the backend's stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    /// Model loaded; commands may be sent.
    Ready,
    /// Informational status that does not settle any command.
    Progress { message: String },
    /// A command finished. `response` carries the full generated text when the
    /// backend includes it.
    Success {
        message: String,
        response: Option<String>,
    },
    /// The backend rejected or failed a command.
    Error { message: String },
}

/// Raw JSON shape of a status line. Every field is optional; unknown fields
/// (timestamps, data blobs) are ignored.
#[derive(Deserialize)]
pub(crate) struct RawStatus {
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub response: Option<String>,
}
