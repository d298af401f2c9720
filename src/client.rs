//! The public chat client: start a backend, talk to it, stop it.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::backend::{BackendState, ProcessSupervisor, ShutdownReport, SupervisorSettings};
use crate::error::{ChatError, ContextError, StartupError};
use crate::output::{NullTranscript, TranscriptSink};
use crate::protocol::ThinkingTags;
use crate::session::{
    ChatOptions, ContextSnapshot, ConversationSession, ConversationState, ImportMode, MarkerDetector,
    ResponseWaiter, WaitPolicy, DEFAULT_COMPLETION_MARKERS, DEFAULT_STREAM_END_MARKERS,
};

/// Everything the client needs to launch and talk to a backend.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub backend_path: PathBuf,
    pub model_config: PathBuf,
    pub supervisor: SupervisorSettings,
    pub wait: WaitPolicy,
    /// Success messages containing one of these settle a chat.
    pub completion_markers: Vec<String>,
    /// Success messages saying generation finished; the full response line
    /// is awaited after one of these.
    pub stream_end_markers: Vec<String>,
    /// Local history bound; 0 keeps everything.
    pub max_history: usize,
    /// Local history bound in estimated tokens; 0 disables.
    pub max_token_total: usize,
    /// Tags separating reasoning from the answer; `None` leaves replies as is.
    pub thinking: Option<ThinkingTags>,
    /// Applied right after the backend reports ready.
    pub system_prompt: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend_path: PathBuf::from("./llm_stdio_backend"),
            model_config: PathBuf::from("./model/config.json"),
            supervisor: SupervisorSettings::default(),
            wait: WaitPolicy::default(),
            completion_markers: DEFAULT_COMPLETION_MARKERS.iter().map(|m| m.to_string()).collect(),
            stream_end_markers: DEFAULT_STREAM_END_MARKERS.iter().map(|m| m.to_string()).collect(),
            max_history: 0,
            max_token_total: 0,
            thinking: Some(ThinkingTags::default()),
            system_prompt: None,
        }
    }
}

/// Result of a timed chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
    pub thinking: Option<String>,
    pub elapsed: Duration,
}

pub struct ChatClient {
    settings: ClientSettings,
    session: ConversationSession,
    transcript: Box<dyn TranscriptSink>,
}

impl ChatClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_transcript(settings, Box::new(NullTranscript))
    }

    pub fn with_transcript(settings: ClientSettings, transcript: Box<dyn TranscriptSink>) -> Self {
        let supervisor = ProcessSupervisor::new(settings.supervisor);
        let detector = MarkerDetector::new(
            settings.completion_markers.clone(),
            settings.stream_end_markers.clone(),
        );
        let mut waiter = ResponseWaiter::new(settings.wait, Box::new(detector));
        if let Some(tags) = settings.thinking.clone() {
            waiter = waiter.with_thinking(tags);
        }
        let history = ConversationState::new(settings.max_history).with_token_limit(settings.max_token_total);
        let session = ConversationSession::new(supervisor, waiter, history);
        Self {
            settings,
            session,
            transcript,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Launch the configured backend and wait for it to become ready.
    ///
    /// A configured system prompt is applied once the backend is ready; a
    /// failure there is logged and does not fail startup.
    pub async fn start(&mut self) -> Result<(), StartupError> {
        let backend = self.settings.backend_path.clone();
        let model = self.settings.model_config.clone();
        self.start_with(&backend, &model).await
    }

    pub async fn start_with(&mut self, executable: &Path, model_config: &Path) -> Result<(), StartupError> {
        let started = Instant::now();
        self.session
            .supervisor_mut()
            .start(executable, model_config)
            .await?;
        self.transcript.system(&format!(
            "Backend ready ({:.1}s)",
            started.elapsed().as_secs_f64()
        ));

        if let Some(prompt) = self.settings.system_prompt.clone() {
            if let Err(e) = self.set_system_prompt(&prompt).await {
                warn!(error = %e, "failed to apply configured system prompt");
            }
        }
        Ok(())
    }

    pub async fn chat(&mut self, prompt: &str) -> Result<String, ChatError> {
        self.chat_with(prompt, ChatOptions::default())
            .await
            .map(|reply| reply.text)
    }

    /// Chat with per-call options, reporting how long the exchange took.
    pub async fn chat_with(&mut self, prompt: &str, options: ChatOptions) -> Result<ChatReply, ChatError> {
        self.transcript.user(prompt);
        let started = Instant::now();

        match self.session.chat(prompt, options, self.transcript.as_ref()).await {
            Ok(reply) => {
                let elapsed = started.elapsed();
                self.transcript.assistant_done(&reply.text);
                self.transcript.timing(elapsed, reply.text.chars().count());
                Ok(ChatReply {
                    text: reply.text,
                    thinking: reply.thinking,
                    elapsed,
                })
            }
            Err(e) => {
                self.transcript.error(&e.to_string());
                Err(e)
            }
        }
    }

    pub async fn set_system_prompt(&mut self, text: &str) -> Result<(), ChatError> {
        match self.session.set_system_prompt(text, self.transcript.as_ref()).await {
            Ok(()) => {
                self.transcript.system("System prompt set");
                Ok(())
            }
            Err(e) => {
                self.transcript.error(&e.to_string());
                Err(e)
            }
        }
    }

    /// Send an empty system prompt and forget the local one.
    pub async fn clear_system_prompt(&mut self) -> Result<(), ChatError> {
        self.set_system_prompt("").await
    }

    /// Forget the conversation. Never fails.
    pub async fn reset_context(&mut self) {
        self.session.reset().await;
        self.transcript.system("Conversation reset");
    }

    /// Save the local conversation to `path` as JSON.
    pub fn export_context(&self, path: &Path, include_thinking: bool) -> Result<(), ContextError> {
        self.session.export_context(include_thinking).save(path)?;
        info!(path = %path.display(), "conversation exported");
        Ok(())
    }

    /// Load a saved conversation into the local history. Returns how many
    /// turns were read.
    pub fn import_context(&mut self, path: &Path, mode: ImportMode) -> Result<usize, ContextError> {
        let snapshot = ContextSnapshot::load(path)?;
        Ok(self.session.import_context(snapshot, mode))
    }

    pub async fn stop_backend(&mut self) -> ShutdownReport {
        let report = self.session.stop().await;
        if !report.steps.is_empty() {
            info!(steps = ?report.steps, exit_code = ?report.exit_code, "backend stopped");
        }
        report
    }

    pub fn state(&self) -> BackendState {
        self.session.state()
    }

    pub fn is_alive(&mut self) -> bool {
        self.session.supervisor_mut().is_alive()
    }

    pub fn history(&self) -> &ConversationState {
        self.session.history()
    }

    pub fn summary(&self) -> String {
        self.session.history().summary()
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.session.system_prompt()
    }

    /// True after a timed-out exchange until the next reset.
    pub fn is_tainted(&self) -> bool {
        self.session.is_tainted()
    }
}
