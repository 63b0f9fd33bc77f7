use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::command::ToolCommand;
use crate::config::SupervisorConfig;
use crate::error::{OrchestratorError, Result};
use crate::ports::PortAllocation;
use crate::run::{RunConfig, RunId, RunStatus};
use crate::runtime::ShutdownToken;
use crate::store::RunStore;

/// Final classification of a tool process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// One-shot completion signal for a started run.
///
/// Resolves exactly once, after the terminal status has been written to the
/// store, whichever way the process ended.
#[derive(Clone, Debug)]
pub struct RunCompletion {
    run_id: RunId,
    rx: watch::Receiver<Option<RunOutcome>>,
}

impl RunCompletion {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Outcome if the run has already finished.
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait for the outcome.
    ///
    /// Returns `None` only if the monitor went away without reporting.
    pub async fn wait(&mut self) -> Option<RunOutcome> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        // The sender may have written the outcome just before dropping.
        outcome.or_else(|| self.rx.borrow().clone())
    }
}

struct TrackedProcess {
    /// Cleared once the child has been reaped.
    pid: Option<u32>,
    exited: bool,
    cancel_requested: Arc<AtomicBool>,
    kill: ShutdownToken,
    completion: watch::Receiver<Option<RunOutcome>>,
    monitor: Option<JoinHandle<()>>,
}

type ProcessTable = Arc<Mutex<HashMap<RunId, TrackedProcess>>>;

/// Launches the benchmarking tool for a run and watches it to completion.
///
/// Owns the table of live processes. Each started run gets a monitor task
/// that drains output, classifies the exit, writes the terminal status and
/// resolves the run's [`RunCompletion`].
pub struct ProcessSupervisor<S>
where
    S: RunStore + 'static,
{
    store: Arc<S>,
    config: SupervisorConfig,
    processes: ProcessTable,
}

impl<S> fmt::Debug for ProcessSupervisor<S>
where
    S: RunStore + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("store", &std::any::type_name::<S>())
            .field("program", &self.config.program)
            .field("tracked", &self.processes.lock().len())
            .finish()
    }
}

impl<S> ProcessSupervisor<S>
where
    S: RunStore + 'static,
{
    pub fn new(store: Arc<S>, config: SupervisorConfig) -> Self {
        Self {
            store,
            config,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn is_tracked(&self, run_id: RunId) -> bool {
        self.processes.lock().contains_key(&run_id)
    }

    /// OS process id of a tracked run's tool.
    pub fn pid(&self, run_id: RunId) -> Option<u32> {
        self.processes.lock().get(&run_id).and_then(|process| process.pid)
    }

    pub fn tracked_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Completion signal for a tracked run.
    pub fn completion(&self, run_id: RunId) -> Option<RunCompletion> {
        self.processes
            .lock()
            .get(&run_id)
            .map(|process| RunCompletion {
                run_id,
                rx: process.completion.clone(),
            })
    }

    /// Launch the tool for `run_id` and mark the run RUNNING.
    ///
    /// On launch failure the run is marked FAILED and the error returned.
    pub async fn start(
        &self,
        run_id: RunId,
        run: &RunConfig,
        ports: &PortAllocation,
    ) -> Result<RunCompletion> {
        let command = ToolCommand::build(&self.config, run, ports);
        let span = crate::telemetry::run_launch_span(run_id, &command.program);
        self.launch(run_id, command).instrument(span).await
    }

    async fn launch(
        &self,
        run_id: RunId,
        command: ToolCommand,
    ) -> Result<RunCompletion> {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let kill = ShutdownToken::new();

        // Reserve the slot before spawning so concurrent starts cannot both
        // launch the same run.
        {
            let mut processes = self.processes.lock();
            if processes.contains_key(&run_id) {
                return Err(OrchestratorError::AlreadyRunning(run_id));
            }
            processes.insert(
                run_id,
                TrackedProcess {
                    pid: None,
                    exited: false,
                    cancel_requested: Arc::clone(&cancel_requested),
                    kill: kill.clone(),
                    completion: outcome_rx.clone(),
                    monitor: None,
                },
            );
        }

        tracing::info!(run_id = %run_id, command = %command, "launching tool");

        let mut child = match command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                self.processes.lock().remove(&run_id);
                let message =
                    format!("failed to launch `{}`: {source}", command.program);
                tracing::error!(run_id = %run_id, error = %message, "launch failed");
                if let Err(e) = self
                    .store
                    .update_status(run_id, RunStatus::Failed, Some(message))
                    .await
                {
                    tracing::error!(run_id = %run_id, error = %e, "failed to record launch failure");
                }
                return Err(OrchestratorError::Launch {
                    program: command.program,
                    source,
                });
            }
        };

        let pid = child.id();
        tracing::Span::current().record("pid", pid);
        if let Some(process) = self.processes.lock().get_mut(&run_id) {
            process.pid = pid;
        }

        if let Err(e) = self
            .store
            .update_status(run_id, RunStatus::Running, None)
            .await
        {
            // The run left PENDING while we were launching (e.g. cancelled).
            tracing::warn!(run_id = %run_id, error = %e, "run no longer startable, killing tool");
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.processes.lock().remove(&run_id);
            return Err(e.into());
        }
        tracing::info!(run_id = %run_id, pid = ?pid, "tool started");

        let monitor = ProcessMonitor {
            run_id,
            store: Arc::clone(&self.store),
            processes: Arc::clone(&self.processes),
            kill,
            cancel_requested,
            outcome_tx,
            excerpt_chars: self.config.error_excerpt_chars,
            output_drain: self.config.output_drain(),
        };
        let handle = tokio::spawn(monitor.run(child).in_current_span());

        if let Some(process) = self.processes.lock().get_mut(&run_id) {
            process.monitor = Some(handle);
        }

        Ok(RunCompletion {
            run_id,
            rx: outcome_rx,
        })
    }

    /// Terminate a running tool: graceful signal, then kill after the grace
    /// period. Returns once the run is terminal (CANCELLED), or `false`
    /// immediately if the run is not tracked.
    pub async fn stop(&self, run_id: RunId) -> bool {
        let tracked = {
            let processes = self.processes.lock();
            processes.get(&run_id).map(|process| {
                // The monitor marks the exit under this same lock, so a
                // reaped child is never signalled or reclassified.
                if !process.exited {
                    process.cancel_requested.store(true, Ordering::SeqCst);
                }
                (
                    process.exited,
                    process.pid,
                    process.kill.clone(),
                    RunCompletion {
                        run_id,
                        rx: process.completion.clone(),
                    },
                )
            })
        };
        let Some((exited, pid, kill, mut completion)) = tracked else {
            tracing::warn!(run_id = %run_id, "stop requested for untracked run");
            return false;
        };

        if exited {
            tracing::debug!(run_id = %run_id, "tool already exited, waiting for its outcome");
            completion.wait().await;
            return true;
        }

        match pid {
            Some(pid) => {
                tracing::info!(run_id = %run_id, pid = pid, "terminating tool");
                if let Err(e) = terminate(pid) {
                    tracing::warn!(run_id = %run_id, pid = pid, error = %e, "graceful termination failed");
                    kill.cancel();
                }
            }
            // Not spawned yet; the monitor kills it as soon as it starts.
            None => kill.cancel(),
        }

        if tokio::time::timeout(self.config.grace_period(), completion.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                run_id = %run_id,
                grace_ms = self.config.grace_period_ms,
                "tool ignored termination, killing"
            );
            kill.cancel();
            completion.wait().await;
        }
        true
    }

    /// Stop every tracked run and wait for all monitors to finish.
    pub async fn cleanup(&self) {
        let (run_ids, monitors): (Vec<RunId>, Vec<JoinHandle<()>>) = {
            let mut processes = self.processes.lock();
            let run_ids = processes.keys().copied().collect();
            let monitors = processes
                .values_mut()
                .filter_map(|process| process.monitor.take())
                .collect();
            (run_ids, monitors)
        };

        if !run_ids.is_empty() {
            tracing::info!(count = run_ids.len(), "stopping tracked tools");
        }
        join_all(run_ids.into_iter().map(|run_id| self.stop(run_id))).await;

        for monitor in monitors {
            if let Err(e) = monitor.await {
                tracing::warn!(error = %e, "process monitor task failed");
            }
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(std::io::Error::other)?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination is unix-only",
    ))
}

struct ProcessMonitor<S: RunStore + 'static> {
    run_id: RunId,
    store: Arc<S>,
    processes: ProcessTable,
    kill: ShutdownToken,
    cancel_requested: Arc<AtomicBool>,
    outcome_tx: watch::Sender<Option<RunOutcome>>,
    excerpt_chars: usize,
    output_drain: Duration,
}

impl<S: RunStore + 'static> ProcessMonitor<S> {
    async fn run(self, mut child: Child) {
        let run_id = self.run_id;

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain_output(run_id, out, OutputStream::Stdout, 0)));
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(drain_output(
                run_id,
                err,
                OutputStream::Stderr,
                self.excerpt_chars,
            ))
        });

        let waited = tokio::select! {
            status = child.wait() => status,
            _ = self.kill.cancelled() => {
                tracing::warn!(run_id = %run_id, "killing tool");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(run_id = %run_id, error = %e, "kill failed");
                }
                child.wait().await
            }
        };

        // The child is reaped; its pid may be reused from here on.
        let cancel_requested = {
            let mut processes = self.processes.lock();
            if let Some(process) = processes.get_mut(&run_id) {
                process.exited = true;
                process.pid = None;
            }
            self.cancel_requested.load(Ordering::SeqCst)
        };

        let (_, stderr_text) =
            tokio::join!(self.collect_output(stdout), self.collect_output(stderr));

        let outcome = match waited {
            Ok(status) => classify_exit(
                status,
                cancel_requested,
                &stderr_text,
                self.excerpt_chars,
            ),
            Err(e) => RunOutcome {
                status: if cancel_requested {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                },
                exit_code: None,
                error: Some(format!("failed to wait for tool: {e}")),
            },
        };

        tracing::info!(
            run_id = %run_id,
            status = %outcome.status,
            exit_code = ?outcome.exit_code,
            "tool exited"
        );

        if let Err(e) = self
            .store
            .update_status(run_id, outcome.status, outcome.error.clone())
            .await
        {
            tracing::error!(run_id = %run_id, error = %e, "failed to record run outcome");
        }

        self.processes.lock().remove(&run_id);
        self.outcome_tx.send_replace(Some(outcome));
    }

    async fn collect_output(&self, reader: Option<JoinHandle<String>>) -> String {
        let Some(mut reader) = reader else {
            return String::new();
        };
        match tokio::time::timeout(self.output_drain, &mut reader).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "output reader failed");
                String::new()
            }
            Err(_) => {
                // A grandchild may still hold the pipe open.
                tracing::warn!(run_id = %self.run_id, "output not drained in time");
                reader.abort();
                String::new()
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Log every line of `reader`, keeping up to `keep_chars` characters.
async fn drain_output<R>(
    run_id: RunId,
    reader: R,
    stream: OutputStream,
    keep_chars: usize,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut kept = String::new();
    let mut kept_chars = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match stream {
                    OutputStream::Stdout => {
                        tracing::debug!(run_id = %run_id, "stdout: {line}")
                    }
                    OutputStream::Stderr => {
                        tracing::warn!(run_id = %run_id, "stderr: {line}")
                    }
                }
                if kept_chars < keep_chars {
                    kept.push_str(&line);
                    kept.push('\n');
                    kept_chars += line.chars().count() + 1;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(run_id = %run_id, error = %e, "output stream closed");
                break;
            }
        }
    }
    kept
}

fn classify_exit(
    status: ExitStatus,
    cancel_requested: bool,
    stderr: &str,
    excerpt_chars: usize,
) -> RunOutcome {
    let exit_code = status.code();

    if cancel_requested {
        return RunOutcome {
            status: RunStatus::Cancelled,
            exit_code,
            error: None,
        };
    }
    if status.success() {
        return RunOutcome {
            status: RunStatus::Completed,
            exit_code,
            error: None,
        };
    }

    let stderr = stderr.trim();
    let error = if !stderr.is_empty() {
        stderr.chars().take(excerpt_chars).collect()
    } else if let Some(code) = exit_code {
        format!("exit code: {code}")
    } else {
        signal_description(status)
    };

    RunOutcome {
        status: RunStatus::Failed,
        exit_code,
        error: Some(error),
    }
}

#[cfg(unix)]
fn signal_description(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => "terminated without an exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_description(_status: ExitStatus) -> String {
    "terminated without an exit code".to_string()
}
