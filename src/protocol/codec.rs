//! Encoding of commands and decoding of status lines.

use super::messages::{Command, RawStatus, StatusMessage};
use crate::error::ProtocolError;

/// `type` values the backend uses for status lines.
const STATUS_TYPES: &[&str] = &["status", "message", "response"];

/// Encode a command as one newline-terminated JSON line.
pub fn encode(command: &Command) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(command)?;
    if line.contains('\n') {
        return Err(ProtocolError::EmbeddedNewline);
    }
    line.push('\n');
    Ok(line)
}

/// Decode one diagnostic line.
///
/// Returns `None` for anything that is not a recognizable status object:
/// blank lines, plain log text, JSON without a known `type`/`status`.
pub fn decode(line: &str) -> Option<StatusMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: RawStatus = serde_json::from_str(line).ok()?;
    parse_status(raw)
}

fn parse_status(raw: RawStatus) -> Option<StatusMessage> {
    let message_type = raw.message_type.as_deref();
    let status = raw.status.as_deref();
    let known_type = message_type.map_or(true, |t| STATUS_TYPES.contains(&t));
    let message = raw.message.unwrap_or_default();

    if status == Some("ready") {
        return Some(StatusMessage::Ready);
    }
    if message_type == Some("error") || status == Some("error") {
        return Some(StatusMessage::Error { message });
    }
    if status == Some("success") && known_type {
        return Some(StatusMessage::Success {
            message,
            response: raw.response.filter(|r| !r.is_empty()),
        });
    }
    if message_type.is_some() && known_type {
        return Some(StatusMessage::Progress { message });
    }
    None
}
