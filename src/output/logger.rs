//! Tracing subscriber setup for the binary.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingSettings;

/// Environment variable that overrides the terminal log filter.
pub const LOG_ENV: &str = "PIPECHAT_LOG";

/// Level used for the file layer regardless of the terminal filter.
const FILE_LEVEL: &str = "debug";

/// Install the global subscriber: compact lines on stderr, plus an ANSI-free
/// file layer when a log file is configured.
///
/// Returns the path actually written to, if any.
pub fn init(settings: &LoggingSettings) -> Result<Option<PathBuf>> {
    let terminal_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let terminal_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    let Some(requested) = settings.file.as_deref() else {
        tracing_subscriber::registry()
            .with(terminal_layer.with_filter(terminal_filter))
            .try_init()
            .context("failed to install log subscriber")?;
        return Ok(None);
    };

    let path = resolve_log_path(requested);
    let file = open_log_file(&path)?;
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file));

    tracing_subscriber::registry()
        .with(terminal_layer.with_filter(terminal_filter))
        .with(file_layer.with_filter(EnvFilter::new(FILE_LEVEL)))
        .try_init()
        .context("failed to install log subscriber")?;

    Ok(Some(path))
}

/// A directory gets a timestamped log file inside it; anything else is used
/// as the file path.
pub fn resolve_log_path(requested: &Path) -> PathBuf {
    if requested.is_dir() {
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        requested.join(format!("pipechat-{}.log", timestamp))
    } else {
        requested.to_path_buf()
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_gets_timestamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_log_path(dir.path());
        assert_eq!(path.parent().unwrap(), dir.path());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("pipechat-"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn file_path_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let requested = dir.path().join("chat.log");
        assert_eq!(resolve_log_path(&requested), requested);
    }

    #[test]
    fn open_creates_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("logs").join("chat.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }
}
