//! pipechat - chat with a local LLM backend over stdio

use anyhow::{Context, Result};
use colored::Colorize;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use pipechat::cli::{self, Command};
use pipechat::client::ChatClient;
use pipechat::commands::{self, BatchItem, InputCommand};
use pipechat::config::Config;
use pipechat::interrupt::{self, INTERRUPTED_EXIT_CODE};
use pipechat::output::{self, formatter, ConsoleTranscript};
use pipechat::session::ChatOptions;

fn main() -> ExitCode {
    match run() {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = cli::Args::parse_args();
    let config = Config::load(args.config.as_deref(), args.overrides())?;

    if let Some(path) = output::logger::init(&config.logging)? {
        info!(path = %path.display(), "logging to file");
    }
    if let Some(source) = &config.source {
        debug!(path = %source.display(), "loaded config");
    }

    interrupt::register_signal_handler()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(run_command(args.command, config));
    // A pending terminal read would otherwise hold the runtime open.
    runtime.shutdown_background();
    result
}

async fn run_command(command: Command, config: Config) -> Result<ExitCode> {
    // Read batch input before spawning anything.
    let batch = match &command {
        Command::Batch { file, .. } => {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("failed to read prompt file {}", file.display()))?;
            Some(commands::parse_batch(&content))
        }
        _ => None,
    };

    let transcript = ConsoleTranscript::new(config.display);
    let mut client = ChatClient::with_transcript(config.client, Box::new(transcript));

    let Some(started) = interruptible(client.start()).await else {
        return interrupted(&mut client).await;
    };
    started.context("backend failed to start")?;

    let code = match command {
        Command::Chat {
            prompt,
            system,
            max_tokens,
        } => {
            let options = ChatOptions {
                max_new_tokens: max_tokens,
                timeout: None,
            };
            run_single(&mut client, &prompt.join(" "), system.as_deref(), options).await
        }
        Command::Batch { max_tokens, .. } => {
            let options = ChatOptions {
                max_new_tokens: max_tokens,
                timeout: None,
            };
            run_batch(&mut client, batch.unwrap_or_default(), options).await
        }
        Command::Interactive { reset, max_tokens } => {
            let options = ChatOptions {
                max_new_tokens: max_tokens,
                timeout: None,
            };
            run_interactive(&mut client, reset, options).await
        }
    };

    match code {
        Some(code) => {
            client.stop_backend().await;
            Ok(code)
        }
        None => interrupted(&mut client).await,
    }
}

/// Run `fut` unless Ctrl+C arrives first.
async fn interruptible<F: Future>(fut: F) -> Option<F::Output> {
    tokio::select! {
        output = fut => Some(output),
        _ = interrupt::poll_interrupt() => None,
    }
}

async fn interrupted(client: &mut ChatClient) -> Result<ExitCode> {
    eprintln!();
    eprintln!("{}", "Interrupted, stopping backend...".yellow());
    client.stop_backend().await;
    Ok(ExitCode::from(INTERRUPTED_EXIT_CODE))
}

/// `None` means the user interrupted.
async fn run_single(
    client: &mut ChatClient,
    prompt: &str,
    system: Option<&str>,
    options: ChatOptions,
) -> Option<ExitCode> {
    if let Some(system) = system {
        if interruptible(client.set_system_prompt(system)).await?.is_err() {
            return Some(ExitCode::FAILURE);
        }
    }

    match interruptible(client.chat_with(prompt, options)).await? {
        Ok(_) => Some(ExitCode::SUCCESS),
        Err(_) => Some(ExitCode::FAILURE),
    }
}

async fn run_batch(client: &mut ChatClient, items: Vec<BatchItem>, options: ChatOptions) -> Option<ExitCode> {
    let total = items
        .iter()
        .filter(|item| matches!(item, BatchItem::Prompt(_)))
        .count();
    let mut sent = 0;
    let mut failed = 0;

    for item in items {
        match item {
            BatchItem::Reset => client.reset_context().await,
            BatchItem::System(text) => {
                if interruptible(client.set_system_prompt(&text)).await?.is_err() {
                    failed += 1;
                }
            }
            BatchItem::Prompt(prompt) => {
                sent += 1;
                formatter::print_separator();
                println!("{}", format!("[{sent}/{total}]").dimmed());
                if interruptible(client.chat_with(&prompt, options)).await?.is_err() {
                    failed += 1;
                }
            }
        }

        if client.state().is_terminal() {
            eprintln!("{}", "Backend is no longer running, stopping batch".red());
            return Some(ExitCode::FAILURE);
        }
    }

    formatter::print_separator();
    println!("{} prompts, {} failed ({})", sent, failed, client.summary());
    if failed == 0 {
        Some(ExitCode::SUCCESS)
    } else {
        Some(ExitCode::FAILURE)
    }
}

async fn run_interactive(client: &mut ChatClient, reset_each: bool, options: ChatOptions) -> Option<ExitCode> {
    formatter::print_interactive_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} ", ">".cyan().bold());
        let _ = std::io::stdout().flush();

        let line = match interruptible(lines.next_line()).await? {
            Ok(Some(line)) => line,
            Ok(None) => {
                println!();
                return Some(ExitCode::SUCCESS);
            }
            Err(e) => {
                eprintln!("{}", format!("Failed to read input: {e}").red());
                return Some(ExitCode::FAILURE);
            }
        };

        match commands::parse_input(&line) {
            InputCommand::Empty => continue,
            InputCommand::Help => formatter::print_interactive_help(),
            InputCommand::Quit => return Some(ExitCode::SUCCESS),
            InputCommand::Reset => client.reset_context().await,
            InputCommand::History => print_history(client),
            InputCommand::Export(path) => match client.export_context(Path::new(&path), true) {
                Ok(()) => println!("{}", format!("Saved conversation to {path}").dimmed()),
                Err(e) => eprintln!("{}", format!("{:#}", anyhow::Error::new(e)).red()),
            },
            InputCommand::Import { path, mode } => match client.import_context(Path::new(&path), mode) {
                Ok(count) => println!("{}", format!("Loaded {count} turns ({})", client.summary()).dimmed()),
                Err(e) => eprintln!("{}", format!("{:#}", anyhow::Error::new(e)).red()),
            },
            InputCommand::System(text) => {
                let _ = interruptible(client.set_system_prompt(&text)).await?;
            }
            InputCommand::Prompt(prompt) => {
                if reset_each {
                    client.reset_context().await;
                }
                let _ = interruptible(client.chat_with(&prompt, options)).await?;
            }
        }

        if client.state().is_terminal() {
            eprintln!("{}", "Backend is no longer running".red());
            return Some(ExitCode::FAILURE);
        }
    }
}

fn print_history(client: &ChatClient) {
    println!("{}", client.summary().bold());
    if let Some(system) = client.system_prompt() {
        println!("  {} {}", "system:".dimmed(), system);
    }
    for (i, turn) in client.history().turns().iter().enumerate() {
        println!(
            "  {} {} {}",
            format!("{}.", i + 1).dimmed(),
            turn.at.format("%H:%M:%S").to_string().dimmed(),
            turn.prompt
        );
    }
}
