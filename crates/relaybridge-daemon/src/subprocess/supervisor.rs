//! Worker subprocess supervisor.
//!
//! Owns at most one worker process at a time. Requests are written to its
//! stdin as NDJSON lines, stdout is framed into JSON records, stderr is only
//! logged. Whenever the worker exits (any code, signal or I/O failure) the
//! handle is cleared and a restart is scheduled after a fixed delay.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relaybridge_core::config::WorkerConfig;
use relaybridge_core::ndjson::{LineFramer, RequestEnvelope};

/// Size of a single stdout read.
const READ_CHUNK: usize = 8192;

/// How long to wait for buffered stdout after the process has exited.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Output of the supervised worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A JSON record read from the worker's stdout.
    Record(Value),
    /// The worker terminated. `code` is `None` when it was killed by a signal
    /// or could not be waited on.
    Exited { code: Option<i32> },
}

/// Lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
}

/// One stdin line and the writer's verdict on it.
type StdinLine = (String, oneshot::Sender<std::io::Result<()>>);

/// Handle to the running worker.
struct ProcessHandle {
    id: String,
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<StdinLine>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

/// The single worker slot. `generation` changes whenever the handle is
/// replaced or taken, so a stale exit never touches a newer worker.
struct Slot {
    generation: u64,
    handle: Option<ProcessHandle>,
}

struct Inner {
    config: WorkerConfig,
    events: mpsc::Sender<WorkerEvent>,
    slot: Mutex<Slot>,
    state: watch::Sender<WorkerState>,
    stopped: AtomicBool,
    restart_pending: AtomicBool,
}

/// Supervisor for the worker subprocess.
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

impl WorkerSupervisor {
    /// Create a supervisor. Nothing is spawned until [`start`](Self::start).
    pub fn new(config: WorkerConfig, events: mpsc::Sender<WorkerEvent>) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                slot: Mutex::new(Slot {
                    generation: 0,
                    handle: None,
                }),
                state,
                stopped: AtomicBool::new(false),
                restart_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Start the worker, terminating any running instance first.
    ///
    /// A spawn failure is returned and also schedules a restart.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.inner.stopped.store(false, Ordering::SeqCst);

        let previous = {
            let mut slot = self.inner.slot.lock().await;
            slot.generation = slot.generation.wrapping_add(1);
            slot.handle.take()
        };
        if let Some(handle) = previous {
            info!(worker_id = %handle.id, "Replacing running worker");
            terminate(handle, self.inner.config.terminate_timeout()).await;
        }

        self.inner.launch().await
    }

    /// Write one request line to the worker's stdin.
    ///
    /// Fails with [`SupervisorError::NotRunning`] when there is no worker or
    /// its stdin is no longer writable. Retrying is up to the caller.
    pub async fn send(&self, envelope: &RequestEnvelope) -> Result<(), SupervisorError> {
        let line = envelope
            .to_line()
            .map_err(|e| SupervisorError::Encode(e.to_string()))?;

        let (worker_id, stdin_tx) = {
            let slot = self.inner.slot.lock().await;
            let handle = slot.handle.as_ref().ok_or(SupervisorError::NotRunning)?;
            (handle.id.clone(), handle.stdin_tx.clone())
        };

        let (done_tx, done_rx) = oneshot::channel();
        stdin_tx
            .send((line, done_tx))
            .await
            .map_err(|_| SupervisorError::NotRunning)?;
        match done_rx.await {
            Ok(Ok(())) => {
                debug!(worker_id, request_id = envelope.id, "Request written to worker stdin");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(worker_id, request_id = envelope.id, error = %e, "Worker stdin not writable");
                Err(SupervisorError::NotRunning)
            }
            Err(_) => Err(SupervisorError::NotRunning),
        }
    }

    /// Stop the worker and cancel any pending restart.
    ///
    /// Sends SIGINT, waits for the terminate timeout, then kills.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);

        let handle = {
            let mut slot = self.inner.slot.lock().await;
            slot.generation = slot.generation.wrapping_add(1);
            slot.handle.take()
        };
        if let Some(handle) = handle {
            info!(worker_id = %handle.id, "Stopping worker");
            terminate(handle, self.inner.config.terminate_timeout()).await;
        }
        self.inner.state.send_replace(WorkerState::Stopped);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

}

impl Inner {
    /// Spawn a worker into the empty slot.
    async fn launch(self: &Arc<Self>) -> Result<(), SupervisorError> {
        self.state.send_replace(WorkerState::Starting);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }

        info!(
            command = %self.config.command,
            args = ?self.config.args,
            "Spawning worker subprocess"
        );
        let started = cmd
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed {
                reason: e.to_string(),
            })
            .and_then(|mut child| take_stdio(&mut child).map(|stdio| (child, stdio)));
        let (child, (stdin, stdout, stderr)) = match started {
            Ok(started) => started,
            Err(e) => {
                error!(error = %e, "Failed to start worker");
                self.state.send_replace(WorkerState::Stopped);
                let generation = self.slot.lock().await.generation;
                Self::schedule_restart(self, generation);
                return Err(e);
            }
        };

        let worker_id = uuid::Uuid::new_v4().to_string();
        let pid = child.id();

        // Pipe failures end the worker the same way an exit does.
        let (io_failed_tx, io_failed_rx) = mpsc::channel::<()>(1);
        let (stdin_tx, stdin_rx) = mpsc::channel::<StdinLine>(32);
        spawn_stdin_writer(worker_id.clone(), stdin, stdin_rx, io_failed_tx.clone());
        let stdout_task =
            spawn_stdout_reader(worker_id.clone(), stdout, self.events.clone(), io_failed_tx);
        spawn_stderr_logger(worker_id.clone(), stderr);

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let generation = {
            let mut slot = self.slot.lock().await;
            slot.generation = slot.generation.wrapping_add(1);
            slot.handle = Some(ProcessHandle {
                id: worker_id.clone(),
                pid,
                stdin_tx,
                kill_tx: Some(kill_tx),
                exited: exited_rx,
            });
            slot.generation
        };
        self.state.send_replace(WorkerState::Running);
        info!(worker_id, pid, "Worker started");

        let exit = ExitWatch {
            worker_id,
            generation,
            kill_rx,
            io_failed_rx,
            exited_tx,
            stdout_task,
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.supervise(child, exit).await });
        Ok(())
    }

    /// Wait for the worker to exit, then report it and schedule a restart.
    async fn supervise(self: Arc<Self>, mut child: Child, exit: ExitWatch) {
        let ExitWatch {
            worker_id,
            generation,
            mut kill_rx,
            mut io_failed_rx,
            exited_tx,
            stdout_task,
        } = exit;

        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut kill_rx => kill_child(&worker_id, &mut child, "kill requested").await,
            Some(()) = io_failed_rx.recv() => {
                kill_child(&worker_id, &mut child, "worker pipe failed").await
            }
        };

        let code = match &status {
            Ok(status) => {
                log_exit(&worker_id, *status);
                status.code()
            }
            Err(e) => {
                error!(worker_id, error = %e, "Failed to wait for worker");
                None
            }
        };

        // Records written just before exit must reach the bridge before the exit does.
        if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_task)
            .await
            .is_err()
        {
            debug!(worker_id, "stdout still open after exit, not waiting further");
        }

        let current = {
            let mut slot = self.slot.lock().await;
            if slot.generation == generation {
                slot.handle = None;
                true
            } else {
                false
            }
        };
        if current {
            self.state.send_replace(WorkerState::Stopped);
        }
        exited_tx.send_replace(true);

        if self.events.send(WorkerEvent::Exited { code }).await.is_err() {
            debug!(worker_id, "Worker event channel closed");
        }

        if current && !self.stopped.load(Ordering::SeqCst) {
            Self::schedule_restart(&self, generation);
        }
    }

    /// Relaunch after the restart delay unless stopped or already replaced.
    fn schedule_restart(inner: &Arc<Self>, generation: u64) {
        if inner.restart_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = inner.config.restart_delay();
        info!(delay_secs = delay.as_secs(), "Scheduling worker restart");

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.restart_pending.store(false, Ordering::SeqCst);

            if inner.stopped.load(Ordering::SeqCst) {
                debug!("Supervisor stopped, restart cancelled");
                return;
            }
            {
                let slot = inner.slot.lock().await;
                if slot.generation != generation || slot.handle.is_some() {
                    debug!("Worker replaced, restart cancelled");
                    return;
                }
            }
            if let Err(e) = inner.launch().await {
                warn!(error = %e, "Worker restart failed");
            }
        });
    }
}

/// Per-process state handed to the supervise task.
struct ExitWatch {
    worker_id: String,
    generation: u64,
    kill_rx: oneshot::Receiver<()>,
    io_failed_rx: mpsc::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    stdout_task: JoinHandle<()>,
}

fn take_stdio(
    child: &mut Child,
) -> Result<(ChildStdin, ChildStdout, ChildStderr), SupervisorError> {
    match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
        (Some(stdin), Some(stdout), Some(stderr)) => Ok((stdin, stdout, stderr)),
        _ => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Failed to kill worker without stdio");
            }
            Err(SupervisorError::SpawnFailed {
                reason: "Failed to capture worker stdio".to_string(),
            })
        }
    }
}

fn spawn_stdin_writer(
    worker_id: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<StdinLine>,
    io_failed: mpsc::Sender<()>,
) {
    tokio::spawn(async move {
        while let Some((mut line, done)) = rx.recv().await {
            line.push('\n');
            let written = match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            let failed = written.is_err();
            if let Err(e) = &written {
                error!(worker_id, error = %e, "Failed to write to worker stdin");
            }
            let _ = done.send(written);
            if failed {
                let _ = io_failed.try_send(());
                break;
            }
        }
        debug!(worker_id, "stdin writer finished");
    });
}

fn spawn_stdout_reader(
    worker_id: String,
    mut stdout: ChildStdout,
    events: mpsc::Sender<WorkerEvent>,
    io_failed: mpsc::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut framer = LineFramer::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(worker_id, error = %e, "Failed to read worker stdout");
                    let _ = io_failed.try_send(());
                    break;
                }
            };
            let Some(chunk) = buf.get(..n) else { break };
            for record in framer.feed(chunk) {
                if events.send(WorkerEvent::Record(record)).await.is_err() {
                    warn!(worker_id, "Worker event channel closed");
                    return;
                }
            }
        }
        if framer.pending_len() > 0 {
            debug!(
                worker_id,
                pending = framer.pending_len(),
                "Discarding unterminated worker output"
            );
        }
        debug!(worker_id, "stdout reader finished");
    })
}

fn spawn_stderr_logger(worker_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(worker_id, "stderr: {}", line);
        }
        debug!(worker_id, "stderr reader finished");
    });
}

async fn kill_child(
    worker_id: &str,
    child: &mut Child,
    reason: &str,
) -> std::io::Result<ExitStatus> {
    warn!(worker_id, reason, "Killing worker");
    if let Err(e) = child.kill().await {
        warn!(worker_id, error = %e, "Failed to kill worker");
    }
    child.wait().await
}

fn log_exit(worker_id: &str, status: ExitStatus) {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    if status.success() {
        info!(worker_id, "Worker exited with code 0");
    } else {
        warn!(worker_id, code = ?status.code(), signal = ?signal, "Worker exited");
    }
}

/// SIGINT, grace period, then kill.
async fn terminate(mut handle: ProcessHandle, timeout: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = handle.pid {
            // SAFETY: pid is a valid process ID obtained from our own Child handle.
            // kill(2) with SIGINT is safe to call on any owned subprocess.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(worker_id = %handle.id, pid, error = %err, "Failed to send SIGINT");
            }
        }
    }

    let mut exited = handle.exited.clone();
    if tokio::time::timeout(timeout, exited.wait_for(|done| *done))
        .await
        .is_ok()
    {
        info!(worker_id = %handle.id, "Worker exited gracefully");
        return;
    }

    warn!(worker_id = %handle.id, "Timeout waiting for graceful shutdown, killing");
    if let Some(kill_tx) = handle.kill_tx.take() {
        let _ = kill_tx.send(());
    }
    if tokio::time::timeout(timeout, exited.wait_for(|done| *done))
        .await
        .is_err()
    {
        warn!(worker_id = %handle.id, "Worker did not report exit after kill");
    }
}

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Worker is not running")]
    NotRunning,

    #[error("Failed to encode request: {0}")]
    Encode(String),
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn shell(script: &str) -> WorkerConfig {
        WorkerConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            restart_delay_secs: 0,
            terminate_timeout_secs: 1,
            ..WorkerConfig::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for worker event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn echoes_request_through_cat() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = WorkerConfig {
            command: "cat".into(),
            args: Vec::new(),
            ..WorkerConfig::default()
        };
        let supervisor = WorkerSupervisor::new(config, tx);
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), WorkerState::Running);

        let env = RequestEnvelope::chat(7, "resource.create", "chat", "hello", "abc");
        supervisor.send(&env).await.unwrap();

        let WorkerEvent::Record(record) = next_event(&mut rx).await else {
            panic!("expected a record");
        };
        assert_eq!(record["id"], 7);
        assert_eq!(record["params"]["metadata"]["replyTo"], "abc");

        supervisor.stop().await;
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn send_without_worker_is_not_running() {
        let (tx, _rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(WorkerConfig::default(), tx);
        let env = RequestEnvelope::chat(1, "m", "t", "x", "abc");
        assert!(matches!(
            supervisor.send(&env).await,
            Err(SupervisorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn non_json_and_stderr_lines_produce_no_records() {
        let (tx, mut rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(
            shell(r#"echo starting up; echo oops >&2; echo '{"ready":true}'; exec sleep 30"#),
            tx,
        );
        supervisor.start().await.unwrap();

        let WorkerEvent::Record(record) = next_event(&mut rx).await else {
            panic!("expected a record");
        };
        assert_eq!(record["ready"], true);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn exit_is_reported_and_worker_restarts() {
        let (tx, mut rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(shell("exit 3"), tx);
        supervisor.start().await.unwrap();

        assert_eq!(next_event(&mut rx).await, WorkerEvent::Exited { code: Some(3) });
        // Restart delay is zero, so the worker comes back and exits again.
        assert_eq!(next_event(&mut rx).await, WorkerEvent::Exited { code: Some(3) });

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let (tx, _rx) = mpsc::channel(16);
        let config = WorkerConfig {
            command: "/nonexistent/relaybridge-worker".into(),
            restart_delay_secs: 60,
            ..WorkerConfig::default()
        };
        let supervisor = WorkerSupervisor::new(config, tx);
        assert!(matches!(
            supervisor.start().await,
            Err(SupervisorError::SpawnFailed { .. })
        ));
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn stop_kills_worker_ignoring_sigint() {
        let (tx, mut rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(shell(r#"trap "" INT; exec sleep 30"#), tx);
        supervisor.start().await.unwrap();

        tokio::time::timeout(WAIT, supervisor.stop())
            .await
            .expect("stop should fall back to kill");
        assert_eq!(next_event(&mut rx).await, WorkerEvent::Exited { code: None });
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn start_replaces_running_worker() {
        let (tx, mut rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(shell("exec sleep 30"), tx);
        supervisor.start().await.unwrap();
        supervisor.start().await.unwrap();

        // The first worker is terminated by SIGINT.
        assert_eq!(next_event(&mut rx).await, WorkerEvent::Exited { code: None });
        assert_eq!(supervisor.state(), WorkerState::Running);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn closed_stdin_fails_send_and_restarts_worker() {
        let (tx, mut rx) = mpsc::channel(16);
        let supervisor = WorkerSupervisor::new(
            shell(r#"exec 0<&-; echo '{"ready":true}'; exec sleep 30"#),
            tx,
        );
        supervisor.start().await.unwrap();
        let WorkerEvent::Record(record) = next_event(&mut rx).await else {
            panic!("expected a record");
        };
        assert_eq!(record["ready"], true);

        let env = RequestEnvelope::chat(1, "resource.create", "chat", "hello", "abc");
        assert!(matches!(
            supervisor.send(&env).await,
            Err(SupervisorError::NotRunning)
        ));

        // The broken worker is killed and a fresh one comes up.
        assert_eq!(next_event(&mut rx).await, WorkerEvent::Exited { code: None });
        let WorkerEvent::Record(record) = next_event(&mut rx).await else {
            panic!("expected the restarted worker's record");
        };
        assert_eq!(record["ready"], true);
        assert_eq!(supervisor.state(), WorkerState::Running);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn worker_runs_in_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let config = WorkerConfig {
            working_directory: Some(dir.path().to_path_buf()),
            ..shell(r#"printf '{"cwd":"%s"}\n' "$(pwd -P)"; exec sleep 30"#)
        };
        let supervisor = WorkerSupervisor::new(config, tx);
        supervisor.start().await.unwrap();

        let WorkerEvent::Record(record) = next_event(&mut rx).await else {
            panic!("expected a record");
        };
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(record["cwd"], &*expected.to_string_lossy());
        supervisor.stop().await;
    }
}
