//! Configuration file discovery, loading, and validation.
//!
//! Settings come from `pipechat.toml`: an explicit path, else the first one
//! found walking up from the current directory, else built-in defaults.
//! Command-line overrides are applied on top.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::backend::SupervisorSettings;
use crate::client::ClientSettings;
use crate::protocol::ThinkingTags;
use crate::session::{WaitPolicy, DEFAULT_COMPLETION_MARKERS, DEFAULT_STREAM_END_MARKERS};

pub const CONFIG_FILE_NAME: &str = "pipechat.toml";

/// Contents of `pipechat.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub conversation: ConversationSection,
    #[serde(default)]
    pub display: DisplaySettings,
    #[serde(default)]
    pub thinking: ThinkingSection,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// `[client]`: where the backend lives and how long to wait for it.
/// Timeouts are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_backend_path")]
    pub backend_path: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_init_timeout")]
    pub init_timeout: f64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout: f64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: f64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Seconds to wait for the full response line once generation finished.
    #[serde(default = "default_response_settle")]
    pub response_settle: f64,
    #[serde(default = "default_completion_markers")]
    pub completion_markers: Vec<String>,
    #[serde(default = "default_stream_end_markers")]
    pub stream_end_markers: Vec<String>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            backend_path: default_backend_path(),
            model: default_model(),
            init_timeout: default_init_timeout(),
            response_timeout: default_response_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            poll_interval: default_poll_interval(),
            response_settle: default_response_settle(),
            completion_markers: default_completion_markers(),
            stream_end_markers: default_stream_end_markers(),
        }
    }
}

/// `[conversation]`
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConversationSection {
    /// 0 keeps every turn.
    #[serde(default)]
    pub max_history: usize,
    /// Estimated-token bound on local history; 0 disables.
    #[serde(default)]
    pub max_token_total: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// `[thinking]`: reasoning wrapped in tags by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct ThinkingSection {
    /// Strip tags and keep reasoning out of the reply text.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_thinking_start_tags")]
    pub start_tags: Vec<String>,
    #[serde(default = "default_thinking_end_tags")]
    pub end_tags: Vec<String>,
    /// Replies start in reasoning and switch to the answer at an end tag.
    #[serde(default)]
    pub implicit: bool,
    /// Print the reasoning as it streams.
    #[serde(default = "default_true")]
    pub show: bool,
}

impl Default for ThinkingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            start_tags: default_thinking_start_tags(),
            end_tags: default_thinking_end_tags(),
            implicit: false,
            show: true,
        }
    }
}

/// `[display]`
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct DisplaySettings {
    #[serde(default = "default_true")]
    pub show_timing: bool,
    #[serde(default = "default_true")]
    pub show_response_length: bool,
    #[serde(default = "default_true")]
    pub color: bool,
    /// Print reasoning from thinking tags. Set from `[thinking].show`.
    #[serde(skip, default = "default_true")]
    pub show_thinking: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            show_timing: true,
            show_response_length: true,
            color: true,
            show_thinking: true,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingSettings {
    /// `EnvFilter` directive for the terminal.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file, or a directory to create a timestamped file in.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_backend_path() -> String {
    "./llm_stdio_backend".to_string()
}

fn default_model() -> String {
    "./model/config.json".to_string()
}

fn default_init_timeout() -> f64 {
    30.0
}

fn default_response_timeout() -> f64 {
    60.0
}

fn default_shutdown_timeout() -> f64 {
    5.0
}

fn default_poll_interval() -> f64 {
    0.1
}

fn default_response_settle() -> f64 {
    1.0
}

fn default_completion_markers() -> Vec<String> {
    DEFAULT_COMPLETION_MARKERS.iter().map(|m| m.to_string()).collect()
}

fn default_stream_end_markers() -> Vec<String> {
    DEFAULT_STREAM_END_MARKERS.iter().map(|m| m.to_string()).collect()
}

fn default_thinking_start_tags() -> Vec<String> {
    ThinkingTags::default().start
}

fn default_thinking_end_tags() -> Vec<String> {
    ThinkingTags::default().end
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_true() -> bool {
    true
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<PathBuf>,
    pub model: Option<PathBuf>,
    pub response_timeout: Option<f64>,
    pub log_level: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The file the settings were read from, if any.
    pub source: Option<PathBuf>,
    pub client: ClientSettings,
    pub display: DisplaySettings,
    pub logging: LoggingSettings,
}

impl Config {
    /// Load from `explicit` or by discovery from the current directory.
    pub fn load(explicit: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let source = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => discover_from(&env::current_dir()?),
        };
        let file = match &source {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(file, source, overrides)
    }

    /// Merge a parsed file with overrides and validate the result.
    pub fn from_sources(file: FileConfig, source: Option<PathBuf>, overrides: Overrides) -> Result<Self> {
        let FileConfig {
            client,
            conversation,
            mut display,
            thinking: thinking_section,
            mut logging,
        } = file;

        let response_timeout = overrides.response_timeout.unwrap_or(client.response_timeout);
        let supervisor = SupervisorSettings {
            startup_timeout: seconds("init_timeout", client.init_timeout)?,
            shutdown_grace: seconds("shutdown_timeout", client.shutdown_timeout)?,
            poll_interval: seconds("poll_interval", client.poll_interval)?,
        };
        let wait = WaitPolicy {
            timeout: seconds("response_timeout", response_timeout)?,
            poll_interval: supervisor.poll_interval,
            response_settle: seconds("response_settle", client.response_settle)?,
        };

        let completion_markers = non_empty(client.completion_markers);
        let stream_end_markers = non_empty(client.stream_end_markers);
        if completion_markers.is_empty() && stream_end_markers.is_empty() {
            bail!("invalid completion_markers: at least one non-empty marker is required");
        }

        display.show_thinking = thinking_section.enabled && thinking_section.show;
        let thinking = if thinking_section.enabled {
            let tags = ThinkingTags {
                start: non_empty(thinking_section.start_tags),
                end: non_empty(thinking_section.end_tags),
                implicit: thinking_section.implicit,
            };
            if tags.start.is_empty() && tags.end.is_empty() {
                bail!("invalid thinking tags: enabled but no start_tags or end_tags given");
            }
            Some(tags)
        } else {
            None
        };

        let backend_path = overrides
            .backend
            .unwrap_or_else(|| expand_path(&client.backend_path));
        let model_config = overrides.model.unwrap_or_else(|| expand_path(&client.model));

        if let Some(level) = overrides.log_level {
            logging.level = level;
        }
        logging.file = logging.file.map(|p| expand_path(&p.to_string_lossy()));

        Ok(Self {
            source,
            client: ClientSettings {
                backend_path,
                model_config,
                supervisor,
                wait,
                completion_markers,
                stream_end_markers,
                max_history: conversation.max_history,
                max_token_total: conversation.max_token_total,
                thinking,
                system_prompt: conversation.system_prompt.filter(|p| !p.trim().is_empty()),
            },
            display,
            logging,
        })
    }
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values.into_iter().filter(|v| !v.is_empty()).collect()
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        bail!("invalid {}: must be a positive number of seconds, got {}", name, value);
    }
    Ok(Duration::from_secs_f64(value))
}

/// Find `pipechat.toml` in `start` or the nearest ancestor.
pub fn discover_from(start: &Path) -> Option<PathBuf> {
    let mut current = start;

    loop {
        let config_path = current.join(CONFIG_FILE_NAME);
        if config_path.is_file() {
            return Some(config_path);
        }

        current = current.parent()?;
    }
}

/// Load and parse a config file.
pub fn load_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Expand a leading `~` to `$HOME`.
pub fn expand_path(raw: &str) -> PathBuf {
    let home = env::var_os("HOME").map(PathBuf::from);
    match (raw, home) {
        ("~", Some(home)) => home,
        (raw, Some(home)) if raw.starts_with("~/") => home.join(&raw[2..]),
        (raw, _) => PathBuf::from(raw),
    }
}
