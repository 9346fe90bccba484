use crate::tools::process_tool::{ShellProcess, ShellWatch};
use crate::utils::history_ledger::HistoryLedger;
use crate::utils::output_broker::{ActivityStamp, OutputBroker, TerminalEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::time::Duration;

/// The `user@host` half of the synthetic prompt.
#[derive(Debug, Clone)]
pub struct PromptIdentity {
    pub user: String,
    pub host: String,
}

impl PromptIdentity {
    pub fn current() -> Self {
        Self {
            user: whoami::username(),
            host: whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    pub fn prompt(&self, cwd: &Path) -> String {
        format!("{}@{}:{}$ ", self.user, self.host, cwd.display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Mutable per-session state. Only touched while holding the session's lock.
#[derive(Debug)]
pub struct SessionState {
    pub cwd: PathBuf,
    pub process: Option<ShellProcess>,
    pub history: HistoryLedger,
    pub size: Option<TerminalSize>,
}

impl SessionState {
    /// The shell, if it is still running. A shell that has exited is dropped
    /// here so an inactive session never holds a process.
    pub fn live_process(&mut self) -> Option<&mut ShellProcess> {
        if self.process.as_ref().is_some_and(|p| !p.is_running()) {
            self.process = None;
        }
        self.process.as_mut()
    }

    pub fn is_active(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.is_running())
    }
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub history_len: usize,
    pub subscribers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<TerminalSize>,
}

/// Returned by `create_session`. The receiver is subscribed before the initial
/// prompt is emitted, so it sees every event of the new session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    pub events: broadcast::Receiver<TerminalEvent>,
}

#[derive(Debug)]
pub struct TerminalSession {
    id: String,
    created_at: DateTime<Utc>,
    environment: BTreeMap<String, String>,
    identity: Arc<PromptIdentity>,
    prompt_delay: Duration,
    broker: Arc<OutputBroker>,
    activity: Arc<ActivityStamp>,
    /// Readable without the state lock, so teardown never queues behind a
    /// command that is stuck writing to the shell.
    shell: Option<ShellWatch>,
    state: TokioMutex<SessionState>,
}

impl TerminalSession {
    pub fn new(
        id: String,
        environment: BTreeMap<String, String>,
        identity: Arc<PromptIdentity>,
        prompt_delay: Duration,
        broker: Arc<OutputBroker>,
        activity: Arc<ActivityStamp>,
        state: SessionState,
    ) -> Self {
        let shell = state.process.as_ref().map(ShellProcess::watch);
        Self {
            id,
            created_at: Utc::now(),
            environment,
            identity,
            prompt_delay,
            broker,
            activity,
            shell,
            state: TokioMutex::new(state),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn broker(&self) -> &Arc<OutputBroker> {
        &self.broker
    }

    pub fn shell(&self) -> Option<&ShellWatch> {
        self.shell.as_ref()
    }

    pub fn state(&self) -> &TokioMutex<SessionState> {
        &self.state
    }

    pub fn touch(&self) {
        self.activity.touch();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.activity.last()
    }

    pub fn publish(&self, event: TerminalEvent) {
        self.broker.publish(event);
    }

    pub fn emit_output(&self, data: String) {
        self.publish(TerminalEvent::Output { data });
    }

    pub fn emit_prompt(&self, cwd: &Path) {
        self.emit_output(self.identity.prompt(cwd));
    }

    /// Emits a prompt for `cwd` after the configured delay, letting the shell
    /// settle or a display finish clearing first.
    pub fn schedule_prompt(&self, cwd: PathBuf) {
        let broker = self.broker.clone();
        let prompt = self.identity.prompt(&cwd);
        let delay = self.prompt_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broker.publish(TerminalEvent::Output { data: prompt });
        });
    }

    pub async fn summary(&self) -> SessionSummary {
        let state = self.state.lock().await;
        SessionSummary {
            id: self.id.clone(),
            pid: state.process.as_ref().filter(|p| p.is_running()).and_then(|p| p.pid()),
            cwd: state.cwd.clone(),
            is_active: state.is_active(),
            created_at: self.created_at,
            last_activity: self.activity.last(),
            history_len: state.history.len(),
            subscribers: self.broker.subscriber_count(),
            size: state.size,
        }
    }
}
