use crate::error::AppError;
use crate::utils::output_broker::{OutputBroker, TerminalEvent};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio as StdProcessStdio;
use std::sync::{Arc, Mutex as StdMutex};
use sysinfo::{Pid, Signal, System};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, instrument, warn};

const READ_CHUNK_BYTES: usize = 4096;
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the exit event waits for stdout/stderr to drain. Background jobs
/// started by the shell can keep the pipes open after the shell itself is gone.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(Option<i32>),
    Failed(String),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

/// The program and arguments used to start a session's shell.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// Handle to one running shell. Owns the write side of stdin; the child itself
/// lives in a monitor task that publishes its output and exit.
pub struct ShellProcess {
    pid: Option<u32>,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    status: watch::Receiver<ProcessStatus>,
}

impl fmt::Debug for ShellProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellProcess")
            .field("pid", &self.pid)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl ShellProcess {
    /// Builds a handle around an arbitrary stdin writer and status channel.
    pub fn from_parts(
        pid: Option<u32>,
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        status: watch::Receiver<ProcessStatus>,
    ) -> Self {
        Self { pid, stdin, status }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status.borrow().is_running()
    }

    /// A lock-free view of the shell's pid and status.
    pub fn watch(&self) -> ShellWatch {
        ShellWatch {
            pid: self.pid,
            status: self.status.clone(),
        }
    }

    /// Writes `text` plus a newline to the shell's stdin.
    pub async fn write_line(&mut self, text: &str) -> Result<(), AppError> {
        if !self.is_running() {
            return Err(AppError::WriteFailure(format!(
                "shell (pid {:?}) is no longer running",
                self.pid
            )));
        }
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        let write = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.flush().await
        };
        match timeout(STDIN_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AppError::WriteFailure(e.to_string())),
            Err(_) => Err(AppError::WriteFailure(format!(
                "stdin write timed out after {:?}",
                STDIN_WRITE_TIMEOUT
            ))),
        }
    }
}

/// Pid and exit status of a shell, observable without owning its stdin.
#[derive(Debug, Clone)]
pub struct ShellWatch {
    pid: Option<u32>,
    status: watch::Receiver<ProcessStatus>,
}

impl ShellWatch {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.status.borrow().is_running()
    }

    /// Resolves once the shell is no longer running.
    pub async fn exited(&mut self) {
        // A closed channel means the monitor task is gone and the child was reaped.
        let _ = self.status.wait_for(|s| !s.is_running()).await;
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn event(self, data: String) -> TerminalEvent {
        match self {
            StreamKind::Stdout => TerminalEvent::Output { data },
            StreamKind::Stderr => TerminalEvent::Error { data },
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Decodes `bytes` appended to `pending`, holding back an incomplete UTF-8
/// sequence at the end so a character split across two reads is not mangled.
fn decode_chunk(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let out = text.to_owned();
            pending.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            out
        }
    }
}

async fn pump_stream<R>(mut reader: R, broker: Arc<OutputBroker>, kind: StreamKind)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = decode_chunk(&mut pending, &buf[..n]);
                if !data.is_empty() {
                    broker.publish(kind.event(data));
                }
            }
            Err(e) => {
                warn!(stream = %kind, error = %e, "Failed to read from shell");
                broker.publish(TerminalEvent::ProcessError {
                    message: format!("Failed to read {}: {}", kind, e),
                });
                break;
            }
        }
    }
    if !pending.is_empty() {
        broker.publish(kind.event(String::from_utf8_lossy(&pending).into_owned()));
    }
}

async fn monitor_child(
    mut child: Child,
    broker: Arc<OutputBroker>,
    status_tx: watch::Sender<ProcessStatus>,
    sid: String,
) {
    let pid = child.id();
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_stream(stdout, broker.clone(), StreamKind::Stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_stream(stderr, broker.clone(), StreamKind::Stderr)));
    }

    let status_result = child.wait().await;

    let final_event = match status_result {
        Ok(status) => {
            info!(sid = %sid, pid = ?pid, exit_code = ?status.code(), "Shell exited");
            status_tx.send_replace(ProcessStatus::Exited(status.code()));
            TerminalEvent::Exit { code: status.code() }
        }
        Err(e) => {
            error!(sid = %sid, pid = ?pid, error = %e, "Failed to wait for shell");
            let message = format!("Failed to wait for shell: {}", e);
            status_tx.send_replace(ProcessStatus::Failed(message.clone()));
            TerminalEvent::ProcessError { message }
        }
    };

    for pump in pumps {
        let abort = pump.abort_handle();
        if timeout(STREAM_DRAIN_TIMEOUT, pump).await.is_err() {
            debug!(sid = %sid, "Output stream still open after shell exit, abandoning it");
            abort.abort();
        }
    }
    broker.publish(final_event);
}

/// Spawns `spec` in `cwd` with exactly `env` as its environment and starts
/// streaming its output into `broker`. On unix the shell leads a new process
/// group, so everything it starts can be signalled together.
#[instrument(skip(spec, env, broker), fields(shell = %spec.program, cwd = %cwd.display()))]
pub fn spawn_shell(
    sid: &str,
    spec: &ShellSpec,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    broker: Arc<OutputBroker>,
) -> Result<ShellProcess, AppError> {
    let mut command_process = TokioCommand::new(&spec.program);
    command_process
        .args(&spec.args)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(StdProcessStdio::piped())
        .stdout(StdProcessStdio::piped())
        .stderr(StdProcessStdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command_process.process_group(0);

    debug!(args = ?spec.args, "Spawning shell");
    let mut child_instance = command_process.spawn().map_err(|e| {
        error!(error = %e, shell = %spec.program, "Failed to spawn shell");
        AppError::SpawnFailure {
            shell: spec.program.clone(),
            source: e,
        }
    })?;

    let stdin = child_instance.stdin.take().ok_or_else(|| AppError::SpawnFailure {
        shell: spec.program.clone(),
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin was not captured"),
    })?;
    let pid = child_instance.id();

    let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
    tokio::spawn(monitor_child(child_instance, broker, status_tx, sid.to_string()));

    info!(sid = %sid, pid = ?pid, "Shell started");
    Ok(ShellProcess::from_parts(pid, Box::new(stdin), status_rx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownSignal {
    Terminate,
    Kill,
}

/// Delivers teardown signals to a shell and the processes it started.
pub trait Signaller: Send + Sync + fmt::Debug {
    /// Returns true when the signal was delivered.
    fn send(&self, pid: u32, signal: TeardownSignal) -> bool;

    /// Kills whatever is left of the shell's process group after the shell
    /// itself is gone. Returns true when anything was signalled.
    fn sweep_group(&self, pid: u32) -> bool {
        let _ = pid;
        false
    }
}

/// Signals the process group the shell leads. False once the group is empty.
#[cfg(unix)]
fn signal_group(pid: u32, signal: TeardownSignal) -> bool {
    let pgid: libc::pid_t = match pid.try_into() {
        Ok(pgid) => pgid,
        Err(_) => return false,
    };
    let signo = match signal {
        TeardownSignal::Terminate => libc::SIGTERM,
        TeardownSignal::Kill => libc::SIGKILL,
    };

    // SAFETY: a negative pid addresses the process group created for the shell.
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        warn!(pgid, ?signal, error = %err, "Failed to signal process group");
    }
    false
}

/// Signals the shell's whole process group, falling back to the shell's pid
/// alone through sysinfo where no group can be addressed.
#[derive(Debug)]
pub struct ProcessGroupSignaller {
    system: StdMutex<System>, // sysinfo is sync
}

impl ProcessGroupSignaller {
    pub fn new() -> Self {
        Self {
            system: StdMutex::new(System::new()),
        }
    }

    fn signal_pid(&self, pid: u32, signal: TeardownSignal) -> bool {
        let mut sys_guard = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let target = Pid::from_u32(pid);
        if !sys_guard.refresh_process(target) {
            debug!(pid, ?signal, "Process already gone, not signalling");
            return false;
        }
        let Some(process) = sys_guard.process(target) else {
            return false;
        };
        let delivered = match signal {
            TeardownSignal::Terminate => process.kill_with(Signal::Term).unwrap_or(false),
            // Signal::Kill is unsupported on some platforms; kill() falls back to the native call.
            TeardownSignal::Kill => process.kill_with(Signal::Kill).unwrap_or_else(|| process.kill()),
        };
        if !delivered {
            warn!(pid, ?signal, "Failed to deliver signal");
        }
        delivered
    }
}

impl Default for ProcessGroupSignaller {
    fn default() -> Self {
        Self::new()
    }
}

impl Signaller for ProcessGroupSignaller {
    fn send(&self, pid: u32, signal: TeardownSignal) -> bool {
        #[cfg(unix)]
        if signal_group(pid, signal) {
            return true;
        }
        self.signal_pid(pid, signal)
    }

    fn sweep_group(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            signal_group(pid, TeardownSignal::Kill)
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::output_broker::ActivityStamp;
    use tokio::sync::broadcast;

    #[test]
    fn decode_chunk_holds_back_split_characters() {
        let mut pending = Vec::new();
        let snowman = "☃".as_bytes();
        assert_eq!(decode_chunk(&mut pending, &[b'a', snowman[0]]), "a");
        assert_eq!(pending.len(), 1);
        assert_eq!(decode_chunk(&mut pending, &snowman[1..]), "☃");
        assert!(pending.is_empty());
    }

    #[test]
    fn decode_chunk_replaces_invalid_bytes() {
        let mut pending = Vec::new();
        assert_eq!(decode_chunk(&mut pending, &[b'x', 0xff, b'y']), "x\u{fffd}y");
        assert!(pending.is_empty());
    }

    fn sh_spec() -> ShellSpec {
        ShellSpec {
            program: "/bin/sh".to_string(),
            args: Vec::new(),
        }
    }

    fn test_env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        env
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<TerminalEvent>,
        pred: impl Fn(&TerminalEvent) -> bool,
    ) -> TerminalEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event stream closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_output_and_reports_exit() {
        let broker = Arc::new(OutputBroker::new("t", 64, Arc::new(ActivityStamp::new())));
        let mut rx = broker.subscribe().unwrap();
        let cwd = std::env::temp_dir();
        let mut shell = spawn_shell("t", &sh_spec(), &cwd, &test_env(), broker.clone()).unwrap();
        assert!(shell.pid().is_some());

        shell.write_line("echo hello-from-shell").await.unwrap();
        let event = next_matching(&mut rx, |e| matches!(e, TerminalEvent::Output { data } if data.contains("hello-from-shell"))).await;
        assert!(matches!(event, TerminalEvent::Output { .. }));

        shell.write_line("echo oops >&2").await.unwrap();
        next_matching(&mut rx, |e| matches!(e, TerminalEvent::Error { data } if data.contains("oops"))).await;

        shell.write_line("exit 3").await.unwrap();
        let exit = next_matching(&mut rx, |e| matches!(e, TerminalEvent::Exit { .. })).await;
        assert_eq!(exit, TerminalEvent::Exit { code: Some(3) });
        assert_eq!(shell.status(), ProcessStatus::Exited(Some(3)));

        let err = shell.write_line("echo too late").await.unwrap_err();
        assert!(matches!(err, AppError::WriteFailure(_)));
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_failure() {
        let broker = Arc::new(OutputBroker::new("t", 4, Arc::new(ActivityStamp::new())));
        let spec = ShellSpec {
            program: "/definitely/not/a/shell-xyz".to_string(),
            args: Vec::new(),
        };
        let err = spawn_shell("t", &spec, &std::env::temp_dir(), &test_env(), broker).unwrap_err();
        assert!(matches!(err, AppError::SpawnFailure { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn signalling_a_missing_pid_reports_failure() {
        let signaller = ProcessGroupSignaller::new();
        // pid_max on Linux tops out at 2^22
        assert!(!signaller.send(4_194_304 + 17, TeardownSignal::Terminate));
        assert!(!signaller.sweep_group(4_194_304 + 17));
    }
}
