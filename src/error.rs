//! Error types for backend startup, chat exchanges, and the wire codec.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendState;

/// Errors that prevent the backend from reaching the ready state.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The backend executable does not exist.
    #[error("backend executable not found: {}", .0.display())]
    ExecutableMissing(PathBuf),

    /// The backend path exists but cannot be executed.
    #[error("backend path is not an executable file: {}", .0.display())]
    NotExecutable(PathBuf),

    /// The model config passed to the backend does not exist.
    #[error("model config not found: {}", .0.display())]
    ModelConfigMissing(PathBuf),

    /// The OS refused to spawn the process.
    #[error("failed to spawn backend")]
    Spawn(#[source] std::io::Error),

    /// The process exited before announcing readiness.
    #[error("backend exited before becoming ready ({})", describe_exit(.0))]
    ProcessExitedEarly(Option<i32>),

    /// No ready status within the startup timeout.
    #[error("backend not ready after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The backend reported an error while loading.
    #[error("backend reported an error during startup: {0}")]
    BackendReportedError(String),
}

/// Errors from a single command exchange.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The backend process died while the command was outstanding.
    #[error("backend process exited ({})", describe_exit(.0))]
    ProcessExited(Option<i32>),

    /// No completion within the response timeout.
    #[error("no response from backend after {:.1}s", .0.as_secs_f64())]
    ResponseTimeout(Duration),

    /// The backend answered the command with an error status.
    #[error("backend error: {0}")]
    BackendReportedError(String),

    /// A command was attempted while the backend was not ready.
    #[error("backend is not ready (state: {0})")]
    NotReady(BackendState),

    /// Writing the command to the backend's stdin failed.
    #[error("failed to send command to backend")]
    Send(#[source] std::io::Error),

    /// The command could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors from encoding a command.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("encoded command contains a raw newline")]
    EmbeddedNewline,
}

/// Errors saving or loading a conversation file.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to access context file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid context file {}", .path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub(crate) fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal or status unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_is_rendered() {
        let err = StartupError::ProcessExitedEarly(Some(3));
        assert_eq!(err.to_string(), "backend exited before becoming ready (exit code 3)");
    }

    #[test]
    fn missing_exit_code_is_rendered() {
        let err = ChatError::ProcessExited(None);
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn not_ready_names_state() {
        let err = ChatError::NotReady(BackendState::Busy);
        assert_eq!(err.to_string(), "backend is not ready (state: busy)");
    }

    #[test]
    fn timeout_renders_seconds() {
        let err = ChatError::ResponseTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "no response from backend after 1.5s");
    }
}
