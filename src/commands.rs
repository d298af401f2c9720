//! Parsing of batch prompt files and interactive input lines.

use crate::session::ImportMode;

/// One entry of a batch prompt file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchItem {
    Prompt(String),
    Reset,
    System(String),
}

/// Parse a batch file: one prompt per line. Blank lines and `#` comments are
/// skipped; `/reset` and `/system TEXT` are commands.
pub fn parse_batch(content: &str) -> Vec<BatchItem> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            if line == "/reset" {
                BatchItem::Reset
            } else if let Some(text) = line.strip_prefix("/system ") {
                BatchItem::System(text.trim().to_string())
            } else {
                BatchItem::Prompt(line.to_string())
            }
        })
        .collect()
}

/// What a line typed in interactive mode asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Empty,
    Help,
    Reset,
    System(String),
    History,
    /// Save the conversation to a file.
    Export(String),
    /// Load a saved conversation.
    Import { path: String, mode: ImportMode },
    Quit,
    Prompt(String),
}

pub fn parse_input(line: &str) -> InputCommand {
    let line = line.trim();
    if line.is_empty() {
        return InputCommand::Empty;
    }

    match line.to_lowercase().as_str() {
        "help" => return InputCommand::Help,
        "reset" => return InputCommand::Reset,
        "history" => return InputCommand::History,
        "quit" | "exit" | "q" => return InputCommand::Quit,
        _ => {}
    }

    match line.split_once(char::is_whitespace) {
        Some((head, rest)) if head.eq_ignore_ascii_case("system") => {
            InputCommand::System(rest.trim().to_string())
        }
        Some((head, rest)) if head.eq_ignore_ascii_case("export") => {
            InputCommand::Export(rest.trim().to_string())
        }
        Some((head, rest)) if head.eq_ignore_ascii_case("import") => parse_import(rest.trim()),
        _ => InputCommand::Prompt(line.to_string()),
    }
}

/// `import FILE [replace|append|prepend]`
fn parse_import(rest: &str) -> InputCommand {
    if let Some((path, last)) = rest.rsplit_once(char::is_whitespace) {
        if let Ok(mode) = last.parse() {
            return InputCommand::Import {
                path: path.trim().to_string(),
                mode,
            };
        }
    }
    InputCommand::Import {
        path: rest.to_string(),
        mode: ImportMode::default(),
    }
}
