//! CLI argument parsing using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Overrides;

/// Chat with a local LLM backend over stdio.
///
/// The backend is launched as `BACKEND MODEL_CONFIG`, takes JSON commands on
/// stdin, and reports status as JSON lines on stderr.
#[derive(Parser, Debug)]
#[command(name = "pipechat", version, about, long_about = None)]
pub struct Args {
    /// Config file (default: nearest pipechat.toml)
    #[arg(long, global = true, value_name = "FILE", env = "PIPECHAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backend executable
    #[arg(long, global = true, value_name = "PATH", env = "PIPECHAT_BACKEND")]
    pub backend: Option<PathBuf>,

    /// Model config passed to the backend
    #[arg(long, global = true, value_name = "PATH", env = "PIPECHAT_MODEL")]
    pub model: Option<PathBuf>,

    /// Seconds to wait for each response
    #[arg(long, global = true, value_name = "SECS", value_parser = parse_seconds)]
    pub response_timeout: Option<f64>,

    /// Terminal log level: trace, debug, info, warn, error, off
    #[arg(long, global = true, value_name = "LEVEL", value_parser = parse_log_level)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one prompt and print the reply
    Chat {
        /// Prompt text; multiple words are joined with spaces
        #[arg(value_name = "PROMPT", required = true, num_args = 1..)]
        prompt: Vec<String>,

        /// System prompt to set before chatting
        #[arg(long, value_name = "TEXT")]
        system: Option<String>,

        /// Limit on generated tokens
        #[arg(long, value_name = "N")]
        max_tokens: Option<u32>,
    },
    /// Send every prompt in a file, one per line
    Batch {
        /// Prompt file; blank and # lines are skipped, /reset and /system TEXT are commands
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Limit on generated tokens
        #[arg(long, value_name = "N")]
        max_tokens: Option<u32>,
    },
    /// Read prompts from the terminal until quit
    Interactive {
        /// Reset the conversation before every prompt
        #[arg(long)]
        reset: bool,

        /// Limit on generated tokens
        #[arg(long, value_name = "N")]
        max_tokens: Option<u32>,
    },
}

/// Valid log level names.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The subset of arguments that override config file values.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            backend: self.backend.clone(),
            model: self.model.clone(),
            response_timeout: self.response_timeout,
            log_level: self.log_level.clone(),
        }
    }
}

fn parse_seconds(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("invalid number of seconds '{}'", raw))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("timeout must be positive, got '{}'", raw));
    }
    Ok(value)
}

fn parse_log_level(raw: &str) -> Result<String, String> {
    let level = raw.to_ascii_lowercase();
    if VALID_LOG_LEVELS.contains(&level.as_str()) {
        Ok(level)
    } else {
        Err(format!(
            "invalid log level '{}': must be one of {}",
            raw,
            VALID_LOG_LEVELS.join(", ")
        ))
    }
}
