//! Classifies submitted command lines and runs built-ins in-process.
//!
//! Built-ins never reach the shell and are never recorded in history. Every
//! other line is written verbatim to the shell's stdin and recorded once the
//! write succeeds; its output arrives later through the session's broker.

use crate::config::Config;
use crate::error::AppError;
use crate::tools::filesystem_tool::resolve_directory;
use crate::tools::session::{SessionState, TerminalSession};
use crate::utils::audit_logger::AuditLogger;
use crate::utils::output_broker::TerminalEvent;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub const BUILTIN_COMMANDS: &[&str] = &["cd", "pwd", "clear", "echo", "env", "history", "help", "exit"];

const HELP_TEXT: &str = "\
Built-in commands:
  cd [dir]     change the working directory (default: home)
  pwd          print the working directory
  clear        clear the terminal view
  echo [args]  print arguments
  env          print the session environment
  history      list commands sent to the shell
  help         show this help
  exit         close this session

Any other command is passed to the system shell.
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Builtin {
    Cd(Option<String>),
    Pwd,
    Clear,
    Echo(Vec<String>),
    Env,
    History,
    Help,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Empty,
    Builtin(Builtin),
    Forward(String),
}

/// What the caller has to do after a command was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Handled,
    Forwarded,
    /// `exit` was typed; the owning session must be closed.
    CloseRequested,
}

fn unquote(arg: &str) -> &str {
    let quoted = arg.len() >= 2
        && ((arg.starts_with('"') && arg.ends_with('"')) || (arg.starts_with('\'') && arg.ends_with('\'')));
    if quoted {
        &arg[1..arg.len() - 1]
    } else {
        arg
    }
}

/// Decides, from the first whitespace-delimited word, whether `raw` is a built-in.
pub fn classify(raw: &str) -> Route {
    let trimmed = raw.trim();
    let Some(program) = trimmed.split_whitespace().next() else {
        return Route::Empty;
    };
    let rest = trimmed[program.len()..].trim();
    let builtin = match program {
        "cd" => Builtin::Cd((!rest.is_empty()).then(|| unquote(rest).to_string())),
        "pwd" => Builtin::Pwd,
        "clear" => Builtin::Clear,
        "echo" => Builtin::Echo(rest.split_whitespace().map(String::from).collect()),
        "env" => Builtin::Env,
        "history" => Builtin::History,
        "help" => Builtin::Help,
        "exit" => Builtin::Exit,
        _ => return Route::Forward(raw.to_string()),
    };
    Route::Builtin(builtin)
}

pub fn help_text() -> &'static str {
    HELP_TEXT
}

/// Shared by the `cd` built-in and the manager's `change_directory`.
///
/// On success the new cwd is stored and a prompt for it emitted. On a
/// validation failure the message goes to the error stream, followed by a
/// prompt for the unchanged cwd, and the error is returned.
pub async fn change_directory(
    session: &TerminalSession,
    state: &mut SessionState,
    target: Option<&str>,
) -> Result<PathBuf, AppError> {
    let target = target.unwrap_or("~");
    match resolve_directory(&state.cwd, target).await {
        Ok(new_cwd) => {
            debug!(sid = %session.id(), from = %state.cwd.display(), to = %new_cwd.display(), "Changing directory");
            state.cwd = new_cwd.clone();
            session.emit_prompt(&state.cwd);
            Ok(new_cwd)
        }
        Err(e) => {
            let reason = match &e {
                AppError::NotADirectory(_) => "Not a directory",
                _ => "No such file or directory",
            };
            session.publish(TerminalEvent::Error {
                data: format!("cd: {}: {}\n", target, reason),
            });
            session.emit_prompt(&state.cwd);
            Err(e)
        }
    }
}

#[derive(Debug)]
pub struct CommandRouter {
    config: Arc<Config>,
    audit_logger: Option<Arc<AuditLogger>>,
}

impl CommandRouter {
    pub fn new(config: Arc<Config>) -> Self {
        let audit_logger = AuditLogger::from_config(&config).map(Arc::new);
        Self { config, audit_logger }
    }

    /// Routes one command line for a session whose state lock is held by the caller.
    #[instrument(skip(self, session, state), fields(sid = %session.id()))]
    pub async fn route(
        &self,
        session: &TerminalSession,
        state: &mut SessionState,
        raw: &str,
    ) -> Result<RouteOutcome, AppError> {
        match classify(raw) {
            Route::Empty => {
                session.emit_prompt(&state.cwd);
                Ok(RouteOutcome::Handled)
            }
            Route::Builtin(builtin) => self.run_builtin(session, state, builtin).await,
            Route::Forward(command) => self.forward(session, state, command).await,
        }
    }

    async fn run_builtin(
        &self,
        session: &TerminalSession,
        state: &mut SessionState,
        builtin: Builtin,
    ) -> Result<RouteOutcome, AppError> {
        debug!(?builtin, "Running built-in");
        match builtin {
            Builtin::Cd(target) => {
                if let Err(e) = change_directory(session, state, target.as_deref()).await {
                    if !e.is_path_validation() {
                        return Err(e);
                    }
                }
            }
            Builtin::Pwd => {
                session.emit_output(format!("{}\n", state.cwd.display()));
                session.emit_prompt(&state.cwd);
            }
            Builtin::Clear => {
                session.publish(TerminalEvent::Clear);
                session.schedule_prompt(state.cwd.clone());
            }
            Builtin::Echo(args) => {
                session.emit_output(format!("{}\n", args.join(" ")));
                session.emit_prompt(&state.cwd);
            }
            Builtin::Env => {
                let listing: String = session
                    .environment()
                    .iter()
                    .map(|(key, value)| format!("{}={}\n", key, value))
                    .collect();
                session.emit_output(listing);
                session.emit_prompt(&state.cwd);
            }
            Builtin::History => {
                if !state.history.is_empty() {
                    session.emit_output(state.history.render());
                }
                session.emit_prompt(&state.cwd);
            }
            Builtin::Help => {
                session.emit_output(help_text().to_string());
                session.emit_prompt(&state.cwd);
            }
            Builtin::Exit => return Ok(RouteOutcome::CloseRequested),
        }
        Ok(RouteOutcome::Handled)
    }

    async fn forward(
        &self,
        session: &TerminalSession,
        state: &mut SessionState,
        command: String,
    ) -> Result<RouteOutcome, AppError> {
        if self.config.is_command_blocked(&command) {
            warn!(command = %command, "Command execution blocked");
            return Err(AppError::CommandBlocked(command));
        }

        let Some(process) = state.live_process() else {
            return Err(AppError::SessionInactive(session.id().to_string()));
        };
        process.write_line(&command).await?;
        // only commands the shell actually received are recorded
        state.history.record(command.clone(), state.cwd.clone());

        if let Some(audit_logger) = &self.audit_logger {
            audit_logger.log_command(session.id(), &state.cwd, &command).await;
        }
        Ok(RouteOutcome::Forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::process_tool::{ProcessStatus, ShellProcess};
    use crate::tools::session::PromptIdentity;
    use crate::utils::history_ledger::HistoryLedger;
    use crate::utils::output_broker::{ActivityStamp, OutputBroker};
    use std::collections::BTreeMap;
    use tokio::sync::watch;
    use tokio::time::Duration;

    fn session_with(process: ShellProcess) -> TerminalSession {
        let activity = Arc::new(ActivityStamp::new());
        let broker = Arc::new(OutputBroker::new("w", 16, activity.clone()));
        let identity = Arc::new(PromptIdentity {
            user: "u".into(),
            host: "h".into(),
        });
        let state = SessionState {
            cwd: PathBuf::from("/"),
            process: Some(process),
            history: HistoryLedger::new(8),
            size: None,
        };
        TerminalSession::new("w".into(), BTreeMap::new(), identity, Duration::ZERO, broker, activity, state)
    }

    #[tokio::test]
    async fn failed_write_is_not_recorded() {
        let (stdin, reader) = tokio::io::duplex(64);
        drop(reader);
        let (_status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let session = session_with(ShellProcess::from_parts(Some(1), Box::new(stdin), status_rx));
        let router = CommandRouter::new(Arc::new(Config::default()));

        let mut state = session.state().lock().await;
        let result = router.route(&session, &mut state, "ls -la").await;
        assert!(matches!(result, Err(AppError::WriteFailure(_))));
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn forwarding_to_an_exited_shell_reports_inactive() {
        let (stdin, _reader) = tokio::io::duplex(64);
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let session = session_with(ShellProcess::from_parts(Some(1), Box::new(stdin), status_rx));
        let router = CommandRouter::new(Arc::new(Config::default()));
        status_tx.send_replace(ProcessStatus::Exited(Some(0)));

        let mut state = session.state().lock().await;
        let result = router.route(&session, &mut state, "ls").await;
        assert!(matches!(result, Err(AppError::SessionInactive(_))));
        assert!(state.history.is_empty());
        assert!(state.process.is_none());
    }

    #[test]
    fn classifies_builtins_by_first_word() {
        assert_eq!(classify("pwd"), Route::Builtin(Builtin::Pwd));
        assert_eq!(classify("  cd   projects "), Route::Builtin(Builtin::Cd(Some("projects".into()))));
        assert_eq!(classify("cd"), Route::Builtin(Builtin::Cd(None)));
        assert_eq!(classify("cd 'My Documents'"), Route::Builtin(Builtin::Cd(Some("My Documents".into()))));
        assert_eq!(
            classify("echo  hi   there"),
            Route::Builtin(Builtin::Echo(vec!["hi".into(), "there".into()]))
        );
        assert_eq!(classify("exit"), Route::Builtin(Builtin::Exit));
    }

    #[test]
    fn builtin_names_are_case_sensitive_and_whole_words() {
        assert_eq!(classify("PWD"), Route::Forward("PWD".into()));
        assert_eq!(classify("cdx /tmp"), Route::Forward("cdx /tmp".into()));
        assert_eq!(classify("ls -la"), Route::Forward("ls -la".into()));
    }

    #[test]
    fn blank_lines_are_empty() {
        assert_eq!(classify(""), Route::Empty);
        assert_eq!(classify("  \t "), Route::Empty);
    }

    #[test]
    fn help_mentions_every_builtin_and_system_commands() {
        for builtin in BUILTIN_COMMANDS {
            assert!(help_text().contains(builtin), "help is missing {builtin}");
        }
        assert!(help_text().contains("system shell"));
    }
}
