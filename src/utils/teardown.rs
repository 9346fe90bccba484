//! Bounded, escalating shutdown of a session's shell.
//!
//! `Requested -> TerminateSent -> KillSent -> Dead`, each transition driven by a
//! single deadline measured from the moment teardown starts. Exit of the process
//! at any point short-circuits to `Dead`. Signals go to the shell's process
//! group, and once the shell is dead the group is swept so nothing it started
//! outlives the session.

use crate::error::AppError;
use crate::tools::process_tool::{ShellWatch, Signaller, TeardownSignal};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tracing::{debug, info, warn};

/// Time allowed after SIGKILL for the monitor task to reap the child.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownStage {
    Requested,
    TerminateSent,
    KillSent,
    Dead,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub pid: Option<u32>,
    /// Last stage reached. Anything but `Dead` means the process was still
    /// observed as running when the sequence gave up.
    pub stage: TeardownStage,
    pub terminate_sent: bool,
    pub kill_sent: bool,
    /// Leftover members of the shell's process group were killed.
    pub group_swept: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct TeardownSequencer {
    grace: Duration,
    kill_after: Duration,
    signaller: Arc<dyn Signaller>,
}

impl TeardownSequencer {
    /// `grace` is the wait before SIGTERM, `kill_after` the total wait before SIGKILL.
    pub fn new(grace: Duration, kill_after: Duration, signaller: Arc<dyn Signaller>) -> Self {
        Self {
            grace,
            kill_after: kill_after.max(grace),
            signaller,
        }
    }

    /// Upper bound on how long [`run`](Self::run) can take.
    pub fn bound(&self) -> Duration {
        self.kill_after + REAP_TIMEOUT
    }

    fn signal(&self, sid: &str, pid: Option<u32>, signal: TeardownSignal) -> bool {
        match pid {
            Some(pid) => {
                info!(sid = %sid, pid, ?signal, "Escalating shell teardown");
                self.signaller.send(pid, signal)
            }
            None => {
                warn!(sid = %sid, ?signal, "Shell has no pid, cannot signal it");
                false
            }
        }
    }

    /// Shuts the shell down. `exit_request` asks the shell to leave on its own
    /// and gets at most the grace period; signalling never depends on it.
    pub async fn run<F>(&self, sid: &str, mut shell: ShellWatch, exit_request: F) -> TeardownReport
    where
        F: Future<Output = Result<(), AppError>>,
    {
        let started = Instant::now();
        let pid = shell.pid();
        let mut report = TeardownReport {
            pid,
            stage: TeardownStage::Requested,
            terminate_sent: false,
            kill_sent: false,
            group_swept: false,
            elapsed: Duration::ZERO,
        };

        if shell.is_running() {
            match timeout(self.grace, exit_request).await {
                Ok(Ok(())) => debug!(sid = %sid, "Requested cooperative exit"),
                Ok(Err(e)) => debug!(sid = %sid, error = %e, "Cooperative exit request failed"),
                Err(_) => debug!(sid = %sid, "Cooperative exit request timed out"),
            }
        }

        loop {
            let deadline = match report.stage {
                TeardownStage::Requested => started + self.grace,
                TeardownStage::TerminateSent => started + self.kill_after,
                TeardownStage::KillSent => started + self.kill_after + REAP_TIMEOUT,
                TeardownStage::Dead => break,
            };
            tokio::select! {
                biased;
                _ = shell.exited() => {
                    report.stage = TeardownStage::Dead;
                }
                _ = sleep_until(deadline) => match report.stage {
                    TeardownStage::Requested => {
                        report.terminate_sent = self.signal(sid, pid, TeardownSignal::Terminate);
                        report.stage = TeardownStage::TerminateSent;
                    }
                    TeardownStage::TerminateSent => {
                        report.kill_sent = self.signal(sid, pid, TeardownSignal::Kill);
                        report.stage = TeardownStage::KillSent;
                    }
                    _ => {
                        warn!(sid = %sid, pid = ?pid, "Shell still not reaped after SIGKILL, giving up");
                        break;
                    }
                },
            }
        }

        if report.stage == TeardownStage::Dead {
            if let Some(pid) = pid {
                report.group_swept = self.signaller.sweep_group(pid);
                if report.group_swept {
                    info!(sid = %sid, pid, "Killed processes left behind by the shell");
                }
            }
        }

        report.elapsed = started.elapsed();
        info!(sid = %sid, pid = ?pid, stage = ?report.stage, elapsed_ms = report.elapsed.as_millis() as u64, "Teardown finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::process_tool::{ProcessStatus, ShellProcess};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;

    #[derive(Debug)]
    struct RecordingSignaller {
        started: Instant,
        calls: StdMutex<Vec<(TeardownSignal, Duration)>>,
        sweeps: AtomicUsize,
        dies_on: Option<TeardownSignal>,
        status_tx: watch::Sender<ProcessStatus>,
    }

    impl Signaller for RecordingSignaller {
        fn send(&self, _pid: u32, signal: TeardownSignal) -> bool {
            self.calls.lock().unwrap().push((signal, self.started.elapsed()));
            if self.dies_on == Some(signal) {
                self.status_tx.send_replace(ProcessStatus::Exited(None));
            }
            true
        }

        fn sweep_group(&self, _pid: u32) -> bool {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn fixture(dies_on: Option<TeardownSignal>) -> (Arc<RecordingSignaller>, ShellProcess) {
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let signaller = Arc::new(RecordingSignaller {
            started: Instant::now(),
            calls: StdMutex::new(Vec::new()),
            sweeps: AtomicUsize::new(0),
            dies_on,
            status_tx,
        });
        let process = ShellProcess::from_parts(Some(4242), Box::new(tokio::io::sink()), status_rx);
        (signaller, process)
    }

    fn sequencer(signaller: Arc<RecordingSignaller>) -> TeardownSequencer {
        TeardownSequencer::new(Duration::from_secs(1), Duration::from_secs(5), signaller)
    }

    async fn tear_down(seq: &TeardownSequencer, mut process: ShellProcess) -> TeardownReport {
        let shell = process.watch();
        seq.run("s", shell, async move { process.write_line("exit").await }).await
    }

    #[tokio::test(start_paused = true)]
    async fn cooperative_exit_needs_no_signals() {
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let (stdin, mut shell_side) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = shell_side.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"exit\n");
            status_tx.send_replace(ProcessStatus::Exited(Some(0)));
            // keep the pipe open like a real shell would until it is reaped
            let _ = shell_side.read(&mut buf).await;
        });
        let (signaller, _) = fixture(None);
        let process = ShellProcess::from_parts(Some(1), Box::new(stdin), status_rx);

        let report = tear_down(&sequencer(signaller.clone()), process).await;
        assert_eq!(report.stage, TeardownStage::Dead);
        assert!(!report.terminate_sent && !report.kill_sent);
        assert!(report.elapsed < Duration::from_secs(1));
        assert!(signaller.calls.lock().unwrap().is_empty());
        assert!(report.group_swept);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_is_sent_after_grace_period() {
        let (signaller, process) = fixture(Some(TeardownSignal::Terminate));
        let report = tear_down(&sequencer(signaller.clone()), process).await;

        let calls = signaller.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, TeardownSignal::Terminate);
        assert!(calls[0].1 >= Duration::from_secs(1) && calls[0].1 < Duration::from_millis(1100));
        assert_eq!(report.stage, TeardownStage::Dead);
        assert!(report.terminate_sent);
        assert!(!report.kill_sent);
        assert_eq!(signaller.sweeps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_follows_ignored_terminate_at_five_seconds() {
        let (signaller, process) = fixture(Some(TeardownSignal::Kill));
        let report = tear_down(&sequencer(signaller.clone()), process).await;

        let calls = signaller.calls.lock().unwrap().clone();
        let kinds: Vec<_> = calls.iter().map(|(s, _)| *s).collect();
        assert_eq!(kinds, vec![TeardownSignal::Terminate, TeardownSignal::Kill]);
        assert!(calls[1].1 >= Duration::from_secs(5) && calls[1].1 < Duration::from_millis(5100));
        assert_eq!(report.stage, TeardownStage::Dead);
        assert!(report.kill_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_exit_request_does_not_delay_signals() {
        let (signaller, process) = fixture(Some(TeardownSignal::Terminate));
        let seq = sequencer(signaller.clone());
        let report = seq.run("s", process.watch(), std::future::pending()).await;

        let calls = signaller.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1 < Duration::from_millis(1100));
        assert_eq!(report.stage, TeardownStage::Dead);
        drop(process);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_within_bound_when_process_never_dies() {
        let (signaller, process) = fixture(None);
        let seq = sequencer(signaller.clone());
        let report = tear_down(&seq, process).await;

        assert_eq!(report.stage, TeardownStage::KillSent);
        assert!(report.elapsed <= seq.bound());
        assert!(report.elapsed <= Duration::from_millis(5500));
        assert!(!report.group_swept);
    }

    #[tokio::test(start_paused = true)]
    async fn already_exited_process_only_sweeps_the_group() {
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Exited(Some(0)));
        let (signaller, _) = fixture(None);
        let process = ShellProcess::from_parts(Some(7), Box::new(tokio::io::sink()), status_rx);

        let report = tear_down(&sequencer(signaller.clone()), process).await;
        assert_eq!(report.stage, TeardownStage::Dead);
        assert_eq!(report.elapsed, Duration::ZERO);
        assert!(signaller.calls.lock().unwrap().is_empty());
        assert_eq!(signaller.sweeps.load(Ordering::SeqCst), 1);
        drop(status_tx);
    }
}
