//! Command sequencing and local conversation history.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::waiter::{Reply, ResponseWaiter};
use crate::backend::{BackendState, DiagnosticSource, Liveness, ProcessSupervisor, ShutdownReport};
use crate::error::{ChatError, ContextError};
use crate::output::TranscriptSink;
use crate::protocol::Command;

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub prompt: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub at: DateTime<Utc>,
}

/// Rough token count: 1.5 per CJK ideograph, 0.75 per other character.
pub fn estimate_tokens(text: &str) -> usize {
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    (cjk as f64 * 1.5 + other as f64 * 0.75) as usize
}

/// Local record of the conversation. Never consulted by the backend, which
/// keeps its own history.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turns: Vec<Turn>,
    /// Oldest turns are dropped past this many; 0 keeps everything.
    max_history: usize,
    /// Oldest turns are dropped while the estimate exceeds this; 0 disables.
    /// The newest turn is always kept.
    max_tokens: usize,
}

impl ConversationState {
    pub fn new(max_history: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_history,
            max_tokens: 0,
        }
    }

    pub fn with_token_limit(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn push(&mut self, prompt: impl Into<String>, response: impl Into<String>) {
        self.push_turn(Turn {
            prompt: prompt.into(),
            response: response.into(),
            thinking: None,
            at: Utc::now(),
        });
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.enforce_limits();
    }

    fn enforce_limits(&mut self) {
        if self.max_history > 0 && self.turns.len() > self.max_history {
            let excess = self.turns.len() - self.max_history;
            self.turns.drain(..excess);
        }
        if self.max_tokens > 0 {
            while self.turns.len() > 1 && self.token_estimate() > self.max_tokens {
                self.turns.remove(0);
                debug!("dropped oldest turn to stay under token limit");
            }
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Estimated tokens in every prompt and response.
    pub fn token_estimate(&self) -> usize {
        self.turns
            .iter()
            .map(|t| estimate_tokens(&t.prompt) + estimate_tokens(&t.response))
            .sum()
    }

    /// Short description such as `3 turns, 1204 chars`.
    pub fn summary(&self) -> String {
        let chars: usize = self
            .turns
            .iter()
            .map(|t| t.prompt.chars().count() + t.response.chars().count())
            .sum();
        let noun = if self.turns.len() == 1 { "turn" } else { "turns" };
        format!("{} {}, {} chars", self.turns.len(), noun, chars)
    }

    /// Merge imported turns, then re-apply the history bounds.
    pub fn merge(&mut self, turns: Vec<Turn>, mode: ImportMode) {
        match mode {
            ImportMode::Replace => self.turns = turns,
            ImportMode::Append => self.turns.extend(turns),
            ImportMode::Prepend => {
                let newer = std::mem::replace(&mut self.turns, turns);
                self.turns.extend(newer);
            }
        }
        self.enforce_limits();
    }
}

/// How imported turns combine with the current history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImportMode {
    #[default]
    Replace,
    Append,
    Prepend,
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "append" => Ok(Self::Append),
            "prepend" => Ok(Self::Prepend),
            _ => Err(format!(
                "invalid import mode '{raw}': must be one of replace, append, prepend"
            )),
        }
    }
}

/// A saved conversation, written as pretty JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub turns: Vec<Turn>,
    pub exported_at: DateTime<Utc>,
}

impl ContextSnapshot {
    pub fn save(&self, path: &Path) -> Result<(), ContextError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ContextError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ContextError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ContextError> {
        let content = fs::read_to_string(path).map_err(|source| ContextError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ContextError::Format {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Per-call overrides for a chat.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChatOptions {
    pub max_new_tokens: Option<u32>,
    pub timeout: Option<Duration>,
}

/// Serializes commands to one backend and keeps the local transcript.
///
/// Every sending method takes `&mut self`, so at most one command is ever in
/// flight.
pub struct ConversationSession {
    supervisor: ProcessSupervisor,
    waiter: ResponseWaiter,
    history: ConversationState,
    system_prompt: Option<String>,
    /// Set when an exchange timed out; the backend may still be producing
    /// output for it.
    tainted: bool,
}

impl ConversationSession {
    pub fn new(supervisor: ProcessSupervisor, waiter: ResponseWaiter, history: ConversationState) -> Self {
        Self {
            supervisor,
            waiter,
            history,
            system_prompt: None,
            tainted: false,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut ProcessSupervisor {
        &mut self.supervisor
    }

    pub fn history(&self) -> &ConversationState {
        &self.history
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn state(&self) -> BackendState {
        self.supervisor.state()
    }

    /// Send a prompt and wait for the reply. History is only touched on success.
    pub async fn chat(
        &mut self,
        prompt: &str,
        options: ChatOptions,
        sink: &dyn TranscriptSink,
    ) -> Result<Reply, ChatError> {
        let command = Command::Chat {
            prompt: prompt.to_string(),
            max_new_tokens: options.max_new_tokens,
        };
        let reply = self.dispatch(&command, options.timeout, sink).await?;
        self.history.push_turn(Turn {
            prompt: prompt.to_string(),
            response: reply.text.clone(),
            thinking: reply.thinking.clone(),
            at: Utc::now(),
        });
        Ok(reply)
    }

    /// Replace the backend's system prompt. History is kept.
    pub async fn set_system_prompt(
        &mut self,
        text: &str,
        sink: &dyn TranscriptSink,
    ) -> Result<(), ChatError> {
        let command = Command::SystemPrompt {
            text: text.to_string(),
        };
        self.dispatch(&command, None, sink).await?;
        self.system_prompt = if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        };
        Ok(())
    }

    /// Clear local history and ask the backend to do the same.
    ///
    /// The backend's acknowledgment is not awaited; local state is cleared
    /// whether or not the notification could be sent.
    pub async fn reset(&mut self) {
        self.history.clear();
        self.tainted = false;

        if self.supervisor.state() != BackendState::Ready {
            debug!(state = %self.supervisor.state(), "reset while backend not ready, local only");
            return;
        }
        let deadline = self.waiter.deadline(None);
        let Some(handle) = self.supervisor.handle_mut() else {
            return;
        };
        self.waiter.discard_stale(handle, deadline).await;
        match handle.send(&Command::Reset).await {
            Ok(()) => info!("conversation reset"),
            Err(e) => warn!(error = %e, "failed to notify backend of reset"),
        }
    }

    pub async fn stop(&mut self) -> ShutdownReport {
        self.supervisor.stop().await
    }

    /// Snapshot the local history, without reasoning unless asked.
    pub fn export_context(&self, include_thinking: bool) -> ContextSnapshot {
        let turns = self
            .history
            .turns()
            .iter()
            .cloned()
            .map(|mut turn| {
                if !include_thinking {
                    turn.thinking = None;
                }
                turn
            })
            .collect();
        ContextSnapshot {
            system_prompt: self.system_prompt.clone(),
            turns,
            exported_at: Utc::now(),
        }
    }

    /// Load saved turns into the local history. Returns how many were read.
    ///
    /// Only the local record changes: the backend keeps its own history and
    /// the snapshot's system prompt is not applied.
    pub fn import_context(&mut self, snapshot: ContextSnapshot, mode: ImportMode) -> usize {
        let count = snapshot.turns.len();
        self.history.merge(snapshot.turns, mode);
        info!(count, ?mode, "imported conversation turns");
        count
    }

    async fn dispatch(
        &mut self,
        command: &Command,
        timeout: Option<Duration>,
        sink: &dyn TranscriptSink,
    ) -> Result<Reply, ChatError> {
        let state = self.supervisor.state();
        if state != BackendState::Ready {
            return Err(ChatError::NotReady(state));
        }

        self.supervisor.set_state(BackendState::Busy);
        let result = self.exchange(command, timeout, sink).await;

        let died = matches!(result, Err(ChatError::ProcessExited(_))) || !self.supervisor.is_alive();
        if died {
            warn!(command = command.kind(), "backend process died");
            self.supervisor.set_state(BackendState::Failed);
        } else {
            self.supervisor.set_state(BackendState::Ready);
        }

        if let Err(ChatError::ResponseTimeout(_)) = result {
            warn!(command = command.kind(), "timed out waiting for backend, session tainted");
            self.tainted = true;
        }
        result
    }

    async fn exchange(
        &mut self,
        command: &Command,
        timeout: Option<Duration>,
        sink: &dyn TranscriptSink,
    ) -> Result<Reply, ChatError> {
        // The stale drain counts against the same budget as the reply.
        let deadline = self.waiter.deadline(timeout);
        let handle = self
            .supervisor
            .handle_mut()
            .ok_or(ChatError::ProcessExited(None))?;

        if let Liveness::Exited(code) = handle.liveness() {
            return Err(ChatError::ProcessExited(code));
        }

        let stale = self.waiter.discard_stale(handle, deadline).await;
        if stale > 0 {
            debug!(count = stale, "dropped stale backend output before send");
        }

        handle.send(command).await?;
        self.waiter.wait(handle, command, deadline, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SupervisorSettings;
    use crate::output::NullTranscript;
    use crate::session::{MarkerDetector, WaitPolicy};

    fn session() -> ConversationSession {
        ConversationSession::new(
            ProcessSupervisor::new(SupervisorSettings::default()),
            ResponseWaiter::new(WaitPolicy::default(), Box::new(MarkerDetector::default())),
            ConversationState::new(0),
        )
    }

    #[test]
    fn history_is_bounded() {
        let mut state = ConversationState::new(2);
        state.push("a", "1");
        state.push("b", "2");
        state.push("c", "3");
        let prompts: Vec<&str> = state.turns().iter().map(|t| t.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["b", "c"]);
    }

    #[test]
    fn unbounded_history_keeps_everything() {
        let mut state = ConversationState::new(0);
        for i in 0..50 {
            state.push(format!("p{i}"), "r");
        }
        assert_eq!(state.len(), 50);
    }

    #[test]
    fn summary_counts_turns_and_chars() {
        let mut state = ConversationState::default();
        assert_eq!(state.summary(), "0 turns, 0 chars");
        state.push("hi", "hello");
        assert_eq!(state.summary(), "1 turn, 7 chars");
        state.push("你好", "ok");
        assert_eq!(state.summary(), "2 turns, 11 chars");
    }

    #[test]
    fn token_limit_drops_oldest_turns() {
        let mut state = ConversationState::new(0).with_token_limit(25);
        state.push("aaaa aaaa", "bbbb bbbb");
        state.push("cccc", "dddd");
        assert_eq!(state.len(), 2);
        state.push("你好你好你好", "再见再见再见");
        let prompts: Vec<&str> = state.turns().iter().map(|t| t.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["cccc", "你好你好你好"]);
        assert!(state.token_estimate() <= 25);
    }

    #[test]
    fn token_limit_keeps_newest_turn() {
        let mut state = ConversationState::new(0).with_token_limit(1);
        state.push("a long prompt", "a long response");
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn token_estimate_weights_cjk() {
        assert_eq!(estimate_tokens("abcd"), 3);
        assert_eq!(estimate_tokens("你好"), 3);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn merge_modes() {
        let mut state = ConversationState::new(0);
        state.push("current", "r");
        let saved = || {
            let mut other = ConversationState::new(0);
            other.push("saved", "r");
            other.turns().to_vec()
        };

        state.merge(saved(), ImportMode::Prepend);
        let prompts: Vec<&str> = state.turns().iter().map(|t| t.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["saved", "current"]);

        state.merge(saved(), ImportMode::Append);
        assert_eq!(state.turns().last().map(|t| t.prompt.as_str()), Some("saved"));
        assert_eq!(state.len(), 3);

        state.merge(saved(), ImportMode::Replace);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn merge_respects_history_bound() {
        let mut state = ConversationState::new(2);
        let turns: Vec<Turn> = (0..5)
            .map(|i| Turn {
                prompt: format!("p{i}"),
                response: "r".into(),
                thinking: None,
                at: Utc::now(),
            })
            .collect();
        state.merge(turns, ImportMode::Replace);
        let prompts: Vec<&str> = state.turns().iter().map(|t| t.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["p3", "p4"]);
    }

    #[test]
    fn import_mode_parses() {
        assert_eq!("append".parse::<ImportMode>(), Ok(ImportMode::Append));
        assert_eq!("PREPEND".parse::<ImportMode>(), Ok(ImportMode::Prepend));
        assert!("merge".parse::<ImportMode>().is_err());
    }

    #[test]
    fn snapshot_file_round_trip_and_thinking_filter() {
        let mut exporter = session();
        exporter.system_prompt = Some("be brief".into());
        exporter.history.push_turn(Turn {
            prompt: "q".into(),
            response: "a".into(),
            thinking: Some("hmm".into()),
            at: Utc::now(),
        });

        let without = exporter.export_context(false);
        assert_eq!(without.turns[0].thinking, None);
        assert_eq!(without.system_prompt.as_deref(), Some("be brief"));

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("context.json");
        exporter.export_context(true).save(&path).unwrap();
        let loaded = ContextSnapshot::load(&path).unwrap();
        assert_eq!(loaded.turns[0].thinking.as_deref(), Some("hmm"));

        let mut fresh = session();
        assert_eq!(fresh.import_context(loaded, ImportMode::Replace), 1);
        assert_eq!(fresh.history().turns()[0].response, "a");
        assert_eq!(fresh.system_prompt(), None);
    }

    #[test]
    fn malformed_snapshot_is_a_format_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("context.json");
        fs::write(&path, "{\"turns\": 3}").unwrap();
        assert!(matches!(ContextSnapshot::load(&path), Err(ContextError::Format { .. })));
        assert!(matches!(
            ContextSnapshot::load(&dir.path().join("missing.json")),
            Err(ContextError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn chat_requires_ready_backend() {
        let mut session = session();
        let err = session
            .chat("hi", ChatOptions::default(), &NullTranscript)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotReady(BackendState::NotStarted)));
        assert!(session.history().is_empty());
        assert_eq!(session.state(), BackendState::NotStarted);
    }

    #[tokio::test]
    async fn reset_without_backend_clears_locally() {
        let mut session = session();
        session.history.push("q", "a");
        session.tainted = true;
        session.reset().await;
        assert!(session.history().is_empty());
        assert!(!session.is_tainted());
    }
}
