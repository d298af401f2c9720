//! Terminal output formatting with ANSI colors.

use colored::Colorize;
use std::io::Write;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::transcript::TranscriptSink;
use crate::config::DisplaySettings;

/// Prints the conversation to stdout and diagnostics to stderr.
pub struct ConsoleTranscript {
    display: DisplaySettings,
    /// Set once fragments of the current reply were printed.
    streamed: AtomicBool,
    /// Set while a run of thinking text is on screen.
    thinking: AtomicBool,
}

impl ConsoleTranscript {
    pub fn new(display: DisplaySettings) -> Self {
        if !display.color {
            colored::control::set_override(false);
        }
        Self {
            display,
            streamed: AtomicBool::new(false),
            thinking: AtomicBool::new(false),
        }
    }
}

impl TranscriptSink for ConsoleTranscript {
    fn system(&self, text: &str) {
        println!("{}", text.dimmed());
    }

    fn user(&self, prompt: &str) {
        println!("{} {}", "You:".cyan().bold(), prompt);
        self.streamed.store(false, Ordering::SeqCst);
        self.thinking.store(false, Ordering::SeqCst);
    }

    fn assistant_fragment(&self, text: &str) {
        if self.thinking.swap(false, Ordering::SeqCst) {
            println!();
        }
        if !self.streamed.swap(true, Ordering::SeqCst) {
            print!("{} ", "Assistant:".green().bold());
        }
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn thinking_fragment(&self, text: &str) {
        if !self.display.show_thinking {
            return;
        }
        if !self.thinking.swap(true, Ordering::SeqCst) {
            print!("{} ", "Thinking:".yellow().bold());
        }
        print!("{}", text.yellow());
        let _ = std::io::stdout().flush();
    }

    fn assistant_done(&self, text: &str) {
        if self.thinking.swap(false, Ordering::SeqCst) {
            println!();
        }
        if self.streamed.swap(false, Ordering::SeqCst) {
            println!();
        } else {
            println!("{} {}", "Assistant:".green().bold(), text);
        }
    }

    fn error(&self, message: &str) {
        eprintln!("{}", format!("✗ {message}").red());
    }

    fn timing(&self, elapsed: Duration, chars: usize) {
        let mut parts = Vec::new();
        if self.display.show_timing {
            parts.push(format!("{:.2}s", elapsed.as_secs_f64()));
        }
        if self.display.show_response_length {
            parts.push(format!("{chars} chars"));
        }
        if !parts.is_empty() {
            println!("{}", format!("({})", parts.join(", ")).dimmed());
        }
    }
}

/// Print a separator line across the terminal.
pub fn print_separator() {
    let width = terminal_width();
    println!("{}", "-".repeat(width).dimmed());
}

/// Print the interactive-mode help text.
pub fn print_interactive_help() {
    println!("{}", "Commands:".bold());
    println!("  {}          show this help", "help".cyan());
    println!("  {}         clear the conversation", "reset".cyan());
    println!("  {}   replace the system prompt", "system TEXT".cyan());
    println!("  {}       show conversation summary", "history".cyan());
    println!("  {}   save the conversation as JSON", "export FILE".cyan());
    println!("  {}   load a saved conversation", "import FILE".cyan());
    println!("  {}  leave", "quit, exit, q".cyan());
}

fn terminal_width() -> usize {
    Command::new("tput")
        .arg("cols")
        .output()
        .ok()
        .and_then(|out| {
            if out.status.success() {
                String::from_utf8_lossy(&out.stdout)
                    .trim()
                    .parse()
                    .ok()
            } else {
                None
            }
        })
        .unwrap_or(80)
}
