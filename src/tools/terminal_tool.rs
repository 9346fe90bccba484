use crate::config::Config;
use crate::error::AppError;
use crate::tools::command_router::{self, CommandRouter, RouteOutcome};
use crate::tools::filesystem_tool::{self, resolve_directory};
use crate::tools::process_tool::{spawn_shell, ProcessGroupSignaller, ShellSpec, Signaller};
use crate::tools::session::{
    PromptIdentity, SessionHandle, SessionState, SessionSummary, TerminalSession, TerminalSize,
};
use crate::utils::history_ledger::{HistoryEntry, HistoryLedger};
use crate::utils::output_broker::{ActivityStamp, OutputBroker, TerminalEvent};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::utils::teardown::{TeardownReport, TeardownSequencer};

const PROMPT_PS1: &str = "\\u@\\h:\\w\\$ ";

/// Owns every live session. The registry lock is only held for map
/// operations and is never held while waiting on a session's own lock.
#[derive(Debug)]
pub struct TerminalManager {
    config: Arc<Config>,
    shell: ShellSpec,
    identity: Arc<PromptIdentity>,
    router: CommandRouter,
    sequencer: TeardownSequencer,
    sessions: Arc<TokioMutex<HashMap<String, Arc<TerminalSession>>>>,
    teardowns: StdMutex<Vec<JoinHandle<Option<TeardownReport>>>>,
}

impl TerminalManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_signaller(config, Arc::new(ProcessGroupSignaller::new()))
    }

    pub fn with_signaller(config: Arc<Config>, signaller: Arc<dyn Signaller>) -> Self {
        let sequencer = TeardownSequencer::new(config.teardown_grace(), config.teardown_kill_after(), signaller);
        Self {
            shell: ShellSpec {
                program: config.default_shell.clone(),
                args: config.shell_args.clone(),
            },
            identity: Arc::new(PromptIdentity::current()),
            router: CommandRouter::new(config.clone()),
            sequencer,
            sessions: Arc::new(TokioMutex::new(HashMap::new())),
            teardowns: StdMutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    fn session_environment(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.insert("TERM".to_string(), self.config.term_type.clone());
        env.insert("PS1".to_string(), PROMPT_PS1.to_string());
        env
    }

    async fn lookup(&self, session_id: &str) -> Result<Arc<TerminalSession>, AppError> {
        let sessions_map_guard = self.sessions.lock().await;
        sessions_map_guard
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))
    }

    async fn initial_cwd(&self, cwd: Option<&Path>) -> Result<PathBuf, AppError> {
        let root = &self.config.terminal_root;
        match cwd {
            None => Ok(root.clone()),
            Some(path) => {
                let target = path
                    .to_str()
                    .ok_or_else(|| AppError::InvalidPath(path.to_string_lossy().into_owned()))?;
                resolve_directory(root, target).await
            }
        }
    }

    /// Detaches the session's listeners and tears its shell down in the background.
    ///
    /// Signalling works from the session's [`ShellWatch`](crate::tools::process_tool::ShellWatch),
    /// so a command holding the state lock cannot hold up the teardown. Only
    /// the polite `exit` waits for the lock, and the sequencer bounds that wait.
    fn start_teardown(&self, session: Arc<TerminalSession>) {
        session.broker().detach();
        let sequencer = self.sequencer.clone();
        let handle = tokio::spawn(async move {
            let Some(shell) = session.shell().cloned() else {
                debug!(sid = %session.id(), "Session had no shell to tear down");
                return None;
            };
            let exit_request = async {
                let mut state = session.state().lock().await;
                match state.live_process() {
                    Some(process) => process.write_line("exit").await,
                    None => Ok(()),
                }
            };
            Some(sequencer.run(session.id(), shell, exit_request).await)
        });

        let mut pending = self.teardowns.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Creates a session, replacing any existing one with the same id.
    ///
    /// The shell starts in `cwd` (resolved against the terminal root) or in the
    /// terminal root itself. The first prompt is emitted after the configured
    /// delay, so the returned receiver sees it.
    #[instrument(skip(self, cwd), fields(sid = ?session_id))]
    pub async fn create_session(
        &self,
        session_id: Option<&str>,
        cwd: Option<&Path>,
    ) -> Result<SessionHandle, AppError> {
        let session_id = match session_id {
            Some(id) if id.trim().is_empty() => {
                return Err(AppError::InvalidInputArgument("session id must not be empty".to_string()))
            }
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let cwd = self.initial_cwd(cwd).await?;

        if self.close_session(&session_id).await {
            info!(sid = %session_id, "Replaced existing session");
        }

        let activity = Arc::new(ActivityStamp::new());
        let broker = Arc::new(OutputBroker::new(
            session_id.clone(),
            self.config.event_channel_capacity,
            activity.clone(),
        ));
        let events = broker
            .subscribe()
            .ok_or_else(|| AppError::SessionNotFound(session_id.clone()))?;
        let environment = self.session_environment();
        let process = spawn_shell(&session_id, &self.shell, &cwd, &environment, broker.clone())?;
        let pid = process.pid();

        let session = Arc::new(TerminalSession::new(
            session_id.clone(),
            environment,
            self.identity.clone(),
            self.config.prompt_delay(),
            broker,
            activity,
            SessionState {
                cwd: cwd.clone(),
                process: Some(process),
                history: HistoryLedger::new(self.config.history_capacity),
                size: None,
            },
        ));

        let stale = {
            let mut sessions_map_guard = self.sessions.lock().await;
            sessions_map_guard.insert(session_id.clone(), session.clone())
        };
        if let Some(stale) = stale {
            warn!(sid = %session_id, "Concurrent create replaced a session, tearing the older one down");
            self.start_teardown(stale);
        }

        session.schedule_prompt(cwd.clone());
        info!(sid = %session_id, pid = ?pid, cwd = %cwd.display(), "Session created");

        Ok(SessionHandle {
            id: session_id,
            pid,
            cwd,
            created_at: session.created_at(),
            events,
        })
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionSummary> {
        let session = self.lookup(session_id).await.ok()?;
        Some(session.summary().await)
    }

    #[instrument(skip(self))]
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<TerminalSession>> = {
            let sessions_map_guard = self.sessions.lock().await;
            sessions_map_guard.values().cloned().collect()
        };
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(session.summary().await);
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// A new receiver for the session's events.
    pub async fn subscribe(&self, session_id: &str) -> Result<broadcast::Receiver<TerminalEvent>, AppError> {
        self.lookup(session_id)
            .await?
            .broker()
            .subscribe()
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))
    }

    /// Runs one command line. Built-ins complete before this returns; other
    /// commands return once written to the shell's stdin.
    #[instrument(skip(self), fields(sid = %session_id))]
    pub async fn execute_command(&self, session_id: &str, command: &str) -> Result<(), AppError> {
        let session = self.lookup(session_id).await?;
        session.touch();

        let outcome = {
            let mut state = session.state().lock().await;
            if state.live_process().is_none() {
                return Err(AppError::SessionInactive(session_id.to_string()));
            }
            self.router.route(&session, &mut state, command).await?
        };

        if outcome == RouteOutcome::CloseRequested {
            info!(sid = %session_id, "Session closed by exit");
            self.close_if_current(&session).await;
        }
        Ok(())
    }

    /// Validates and applies a cwd change. Failures are also reported on the
    /// session's error stream.
    #[instrument(skip(self), fields(sid = %session_id))]
    pub async fn change_directory(&self, session_id: &str, path: &str) -> Result<PathBuf, AppError> {
        let session = self.lookup(session_id).await?;
        session.touch();
        let mut state = session.state().lock().await;
        if state.live_process().is_none() {
            return Err(AppError::SessionInactive(session_id.to_string()));
        }
        command_router::change_directory(&session, &mut state, Some(path)).await
    }

    pub async fn get_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, AppError> {
        let session = self.lookup(session_id).await?;
        let state = session.state().lock().await;
        Ok(state.history.entries())
    }

    #[instrument(skip(self), fields(sid = %session_id))]
    pub async fn autocomplete(&self, session_id: &str, partial: &str) -> Result<Vec<String>, AppError> {
        let session = self.lookup(session_id).await?;
        let cwd = session.state().lock().await.cwd.clone();
        Ok(filesystem_tool::complete(&cwd, partial).await)
    }

    /// Records the client's terminal size. There is no pty, so the shell is not told.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), AppError> {
        if cols == 0 || rows == 0 {
            return Err(AppError::InvalidInputArgument(format!(
                "terminal size must be non-zero, got {}x{}",
                cols, rows
            )));
        }
        let session = self.lookup(session_id).await?;
        session.state().lock().await.size = Some(TerminalSize { cols, rows });
        debug!(sid = %session_id, cols, rows, "Terminal resized");
        Ok(())
    }

    /// Removes the session and starts its teardown. Returns without waiting
    /// for the shell to die; false when no such session exists.
    #[instrument(skip(self), fields(sid = %session_id))]
    pub async fn close_session(&self, session_id: &str) -> bool {
        let removed = {
            let mut sessions_map_guard = self.sessions.lock().await;
            sessions_map_guard.remove(session_id)
        };
        match removed {
            Some(session) => {
                info!(sid = %session_id, "Closing session");
                self.start_teardown(session);
                true
            }
            None => false,
        }
    }

    /// Closes `session` only if the registry still maps its id to this very
    /// session, so a racing re-create is left alone.
    async fn close_if_current(&self, session: &Arc<TerminalSession>) -> bool {
        let removed = {
            let mut sessions_map_guard = self.sessions.lock().await;
            match sessions_map_guard.get(session.id()) {
                Some(current) if Arc::ptr_eq(current, session) => sessions_map_guard.remove(session.id()),
                _ => None,
            }
        };
        match removed {
            Some(session) => {
                self.start_teardown(session);
                true
            }
            None => false,
        }
    }

    /// Closes every session and waits for all pending teardowns to finish.
    #[instrument(skip(self))]
    pub async fn close_all(&self) -> Vec<TeardownReport> {
        let drained: Vec<Arc<TerminalSession>> = {
            let mut sessions_map_guard = self.sessions.lock().await;
            sessions_map_guard.drain().map(|(_, session)| session).collect()
        };
        info!(count = drained.len(), "Closing all sessions");
        for session in drained {
            self.start_teardown(session);
        }

        let pending = std::mem::take(&mut *self.teardowns.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        let mut reports = Vec::with_capacity(pending.len());
        for handle in pending {
            match handle.await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Teardown task failed"),
            }
        }
        reports
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(root: &Path) -> Arc<Config> {
        Arc::new(Config {
            default_shell: "/bin/sh".to_string(),
            shell_args: Vec::new(),
            terminal_root: root.to_path_buf(),
            prompt_delay_ms: 5,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn empty_session_id_is_rejected() {
        let tmp = tempdir().unwrap();
        let manager = TerminalManager::new(test_config(tmp.path()));
        let err = manager.create_session(Some("  "), None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInputArgument(_)));
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn missing_initial_cwd_is_rejected_before_spawning() {
        let tmp = tempdir().unwrap();
        let manager = TerminalManager::new(test_config(tmp.path()));
        let err = manager
            .create_session(Some("s"), Some(Path::new("does-not-exist")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PathNotFound(_)));
        assert!(manager.get_session("s").await.is_none());
    }

    #[tokio::test]
    async fn operations_on_unknown_sessions_fail() {
        let tmp = tempdir().unwrap();
        let manager = TerminalManager::new(test_config(tmp.path()));
        assert!(matches!(
            manager.execute_command("ghost", "ls").await,
            Err(AppError::SessionNotFound(_))
        ));
        assert!(matches!(manager.get_history("ghost").await, Err(AppError::SessionNotFound(_))));
        assert!(matches!(manager.autocomplete("ghost", "l").await, Err(AppError::SessionNotFound(_))));
        assert!(matches!(manager.resize("ghost", 80, 24).await, Err(AppError::SessionNotFound(_))));
        assert!(matches!(manager.subscribe("ghost").await, Err(AppError::SessionNotFound(_))));
        assert!(!manager.close_session("ghost").await);
        assert!(manager.close_all().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resize_is_recorded_and_validated() {
        let tmp = tempdir().unwrap();
        let manager = TerminalManager::new(test_config(tmp.path()));
        manager.create_session(Some("r"), None).await.unwrap();

        assert!(matches!(manager.resize("r", 0, 24).await, Err(AppError::InvalidInputArgument(_))));
        manager.resize("r", 120, 40).await.unwrap();
        let summary = manager.get_session("r").await.unwrap();
        assert_eq!(summary.size, Some(TerminalSize { cols: 120, rows: 40 }));
        assert!(summary.is_active);

        manager.close_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn generated_ids_are_unique() {
        let tmp = tempdir().unwrap();
        let manager = TerminalManager::new(test_config(tmp.path()));
        let a = manager.create_session(None, None).await.unwrap();
        let b = manager.create_session(None, None).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.cwd, tmp.path());
        assert_eq!(manager.list_sessions().await.len(), 2);

        let reports = manager.close_all().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(manager.session_count().await, 0);
    }
}
