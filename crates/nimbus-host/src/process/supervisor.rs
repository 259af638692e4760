//! Worker process supervision.
//!
//! [`WorkerProcess`] owns the OS process for one worker: it spawns the
//! command, reads stdout/stderr line by line, waits for exit, classifies the
//! exit code and publishes the resulting events on the bus.
//!
//! Exit classification:
//!
//! | condition                         | events                          |
//! |-----------------------------------|---------------------------------|
//! | negative code (not started)       | none                            |
//! | shutdown was requested            | none                            |
//! | code 0                            | `WorkerRestart`                 |
//! | any other code                    | `WorkerError`, `WorkerRestart`  |

use std::borrow::Cow;
use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::{Captures, Regex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::WorkerCommand;
use super::{LaunchRequest, WorkerHandle, WorkerLauncher};
use crate::bus::{EventBus, HostEvent};
use crate::error::{HostError, Result};
use crate::pair::WorkerId;

/// Stderr lines retained for exit diagnostics.
pub const STDERR_CAPACITY: usize = 3;

/// Time allowed for output readers to drain after exit.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Time allowed for a killed process to be reaped.
const KILL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Exit code reported when the real code is unavailable.
const NOT_STARTED_EXIT_CODE: i32 = -1;

/// How a worker exit is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClassification {
    /// Sentinel code; the process never really ran.
    NotStarted,
    /// The host asked the process to stop.
    Expected,
    /// Clean exit during steady-state operation.
    Graceful,
    /// Unexpected non-zero exit.
    Crashed,
}

impl ExitClassification {
    /// Classifies an exit code.
    #[must_use]
    pub const fn classify(code: i32, shutdown_requested: bool) -> Self {
        if code < 0 {
            Self::NotStarted
        } else if shutdown_requested {
            Self::Expected
        } else if code == 0 {
            Self::Graceful
        } else {
            Self::Crashed
        }
    }
}

/// Final state of a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: i32,
    pub classification: ExitClassification,
}

/// Keys whose values are hidden before a stderr line is retained.
const CREDENTIAL_KEYS: &[&str] = &[
    "AccountKey=",
    "SharedAccessKey=",
    "SharedAccessSignature=",
    "sig=",
    "Password=",
    "pwd=",
    "client_secret=",
    "code=",
    "token=",
];

const HIDDEN_CREDENTIAL: &str = "[Hidden Credential]";

static CREDENTIALS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    let keys: Vec<String> = CREDENTIAL_KEYS.iter().map(|key| regex::escape(key)).collect();
    Regex::new(&format!(r#"(?i)\b({})[^\s;&"',]+"#, keys.join("|"))).ok()
});

/// Replaces credential values in a worker output line.
#[must_use]
pub fn sanitize(line: &str) -> Cow<'_, str> {
    match CREDENTIALS.as_ref() {
        Some(credentials) => credentials.replace_all(line, |caps: &Captures<'_>| {
            format!("{}{HIDDEN_CREDENTIAL}", &caps[1])
        }),
        None => Cow::Borrowed(line),
    }
}

/// Most recent error lines from a worker's stderr, with credentials hidden.
#[derive(Debug)]
pub struct StderrBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl StderrBuffer {
    /// Creates an empty buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let line = line.into();
        let line = sanitize(&line).into_owned();
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Returns the retained lines, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineSeverity {
    Info,
    Warning,
    Error,
}

fn classify_line(line: &str) -> LineSeverity {
    let lower = line.to_ascii_lowercase();
    if lower.contains("warn") {
        LineSeverity::Warning
    } else if ["error", "fail", "severe", "unhandled exception"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        LineSeverity::Error
    } else {
        LineSeverity::Info
    }
}

/// Builds the error describing an unexpected exit.
#[must_use]
pub fn exit_error(executable: &str, code: i32, stderr: Vec<String>) -> HostError {
    let mut message = format!("{executable} exited with code {code} (0x{code:X})");
    if !stderr.is_empty() {
        message.push_str(": ");
        message.push_str(&stderr.join("\n"));
    }
    HostError::WorkerProcessExit {
        message,
        exit_code: code,
        stderr,
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(NOT_STARTED_EXIT_CODE)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(NOT_STARTED_EXIT_CODE)
}

/// A running worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    worker_id: WorkerId,
    runtime: String,
    pid: Option<u32>,
    shutdown_requested: Arc<AtomicBool>,
    kill: CancellationToken,
    exit: watch::Receiver<Option<ExitOutcome>>,
    stderr: Arc<StderrBuffer>,
}

impl WorkerProcess {
    /// Spawns the command and starts monitoring it.
    pub fn start(
        worker_id: WorkerId,
        runtime: impl Into<String>,
        command: &WorkerCommand,
        bus: EventBus,
    ) -> Result<Self> {
        let runtime = runtime.into();
        let mut child = command.to_command().spawn().map_err(|source| {
            error!(worker_id = %worker_id, command = %command, error = %source, "Failed to start worker process");
            HostError::Spawn {
                executable: command.program.clone(),
                source,
            }
        })?;
        let pid = child.id();
        info!(worker_id = %worker_id, runtime = %runtime, pid = ?pid, command = %command, "Worker process started");

        let stderr = Arc::new(StderrBuffer::new(STDERR_CAPACITY));
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(worker_id.clone(), out, None));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(worker_id.clone(), err, Some(stderr.clone())));
        }

        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        {
            let worker_id = worker_id.clone();
            let runtime = runtime.clone();
            let executable = command.executable_name().to_owned();
            let shutdown_requested = shutdown_requested.clone();
            let kill = kill.clone();
            let stderr = stderr.clone();

            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    () = kill.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            warn!(worker_id = %worker_id, error = %e, "Failed to kill worker process");
                        }
                        match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
                            Ok(status) => status,
                            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "kill timed out")),
                        }
                    }
                };

                let code = match status {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        warn!(worker_id = %worker_id, error = %e, "Failed to observe worker exit");
                        NOT_STARTED_EXIT_CODE
                    }
                };

                let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, futures::future::join_all(readers)).await;

                let outcome = handle_exit(
                    &bus,
                    &worker_id,
                    &runtime,
                    &executable,
                    code,
                    shutdown_requested.load(Ordering::SeqCst),
                    stderr.snapshot(),
                );
                let _ = exit_tx.send(Some(outcome));
            });
        }

        Ok(Self {
            worker_id,
            runtime,
            pid,
            shutdown_requested,
            kill,
            exit: exit_rx,
            stderr,
        })
    }

    /// Returns the runtime this process serves.
    #[must_use]
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Returns the retained stderr lines.
    #[must_use]
    pub fn recent_stderr(&self) -> Vec<String> {
        self.stderr.snapshot()
    }

    /// Returns the exit outcome if the process has exited.
    #[must_use]
    pub fn try_exit(&self) -> Option<ExitOutcome> {
        self.exit.borrow().clone()
    }

    /// Waits for the process to exit and be classified.
    pub async fn wait(&self) -> Option<ExitOutcome> {
        let mut exit = self.exit.clone();
        let outcome = match exit.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome
    }

    async fn stop(&self, grace: Duration) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        if self.try_exit().is_some() {
            return;
        }

        if tokio::time::timeout(grace, self.wait()).await.is_err() {
            debug!(worker_id = %self.worker_id, grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX), "Grace period elapsed, killing worker");
            self.kill.cancel();
            let _ = tokio::time::timeout(KILL_TIMEOUT + READER_DRAIN_TIMEOUT, self.wait()).await;
        }
    }
}

#[async_trait]
impl WorkerHandle for WorkerProcess {
    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn shutdown(&self, grace: Duration) {
        self.stop(grace).await;
    }
}

/// Classifies an exit, logs it, and publishes the resulting events.
pub fn handle_exit(
    bus: &EventBus,
    worker_id: &WorkerId,
    runtime: &str,
    executable: &str,
    code: i32,
    shutdown_requested: bool,
    stderr: Vec<String>,
) -> ExitOutcome {
    let classification = ExitClassification::classify(code, shutdown_requested);
    match classification {
        ExitClassification::NotStarted => {
            debug!(worker_id = %worker_id, code, "Ignoring sentinel exit code");
        }
        ExitClassification::Expected => {
            info!(worker_id = %worker_id, code, "Worker process stopped");
        }
        ExitClassification::Graceful => {
            info!(worker_id = %worker_id, runtime, "Worker process exited cleanly");
            bus.publish(HostEvent::WorkerRestart {
                worker_id: worker_id.clone(),
                runtime: runtime.to_owned(),
            });
        }
        ExitClassification::Crashed => {
            let err = exit_error(executable, code, stderr);
            error!(worker_id = %worker_id, runtime, code, error = %err, "Worker process crashed");
            bus.publish(HostEvent::WorkerError {
                worker_id: worker_id.clone(),
                runtime: runtime.to_owned(),
                error: err.to_string(),
            });
            bus.publish(HostEvent::WorkerRestart {
                worker_id: worker_id.clone(),
                runtime: runtime.to_owned(),
            });
        }
    }
    ExitOutcome {
        code,
        classification,
    }
}

fn spawn_reader<R>(worker_id: WorkerId, stream: R, stderr: Option<Arc<StderrBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match &stderr {
                    None => info!(target: "nimbus::worker::stdout", worker_id = %worker_id, "{line}"),
                    Some(buffer) => match classify_line(&line) {
                        LineSeverity::Warning => {
                            warn!(target: "nimbus::worker::stderr", worker_id = %worker_id, "{line}");
                        }
                        LineSeverity::Error => {
                            error!(target: "nimbus::worker::stderr", worker_id = %worker_id, "{line}");
                            buffer.push(line);
                        }
                        LineSeverity::Info => {
                            info!(target: "nimbus::worker::stderr", worker_id = %worker_id, "{line}");
                        }
                    },
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(worker_id = %worker_id, error = %e, "Worker output stream failed");
                    break;
                }
            }
        }
    })
}

/// Starts workers as OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn WorkerHandle>> {
        let process = WorkerProcess::start(
            request.worker_id,
            request.runtime,
            &request.command,
            request.bus,
        )?;
        Ok(Box::new(process))
    }
}
