use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use terminal_sessions::{AppError, Config, TerminalEvent, TerminalManager};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("terminal_sessions={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

/// Copies session events to the console until the session's broker goes away.
async fn print_events(mut events: broadcast::Receiver<TerminalEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                match event {
                    TerminalEvent::Output { data } => print!("{}", data),
                    TerminalEvent::Error { data } => eprint!("{}", data),
                    TerminalEvent::Clear => print!("{}", CLEAR_SCREEN),
                    TerminalEvent::Exit { code } => println!("\n[shell exited with code {:?}]", code),
                    TerminalEvent::ProcessError { message } => eprintln!("\n[shell error: {}]", message),
                }
                let _ = std::io::stdout().flush();
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Console fell behind, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Handles the console's own `:` commands. Returns false for ordinary input.
async fn console_command(manager: &TerminalManager, session_id: &str, line: &str) -> Result<bool> {
    let trimmed = line.trim_start();
    if let Some(partial) = trimmed.strip_prefix(":complete ") {
        let suggestions = manager.autocomplete(session_id, partial).await?;
        println!("{}", suggestions.join("  "));
    } else if trimmed == ":sessions" {
        println!("{}", serde_json::to_string_pretty(&manager.list_sessions().await)?);
    } else if trimmed == ":history" {
        println!("{}", serde_json::to_string_pretty(&manager.get_history(session_id).await?)?);
    } else {
        return Ok(false);
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), shell = %config.default_shell, "Starting terminal-sessions console");
    tracing::debug!("Loaded configuration: {:?}", config);

    let manager = TerminalManager::new(Arc::new(config));
    let handle = manager
        .create_session(None, None)
        .await
        .context("Failed to open the console session")?;
    let session_id = handle.id.clone();
    let printer = tokio::spawn(print_events(handle.events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if console_command(&manager, &session_id, &line).await? {
            continue;
        }
        match manager.execute_command(&session_id, &line).await {
            Ok(()) => {}
            Err(AppError::SessionNotFound(_)) | Err(AppError::SessionInactive(_)) => break,
            Err(e) => eprintln!("{}", e),
        }
        if manager.get_session(&session_id).await.is_none() {
            break;
        }
    }

    let reports = manager.close_all().await;
    for report in &reports {
        tracing::debug!(pid = ?report.pid, stage = ?report.stage, "Shell torn down");
    }
    let _ = printer.await;
    tracing::info!("Console shutdown.");
    Ok(())
}
