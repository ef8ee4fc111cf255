//! Engine subprocess handling.
//!
//! A [`ProcessHandle`] owns one spawned engine and its three standard streams.
//! Output and lifecycle notifications are delivered on a single ordered
//! channel of [`ProcessEvent`]s: every stdout line read before the process
//! exits is sent before the final `Exit`/`Error` event.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch, MutexGuard};
use tokio_util::codec::FramedRead;

use super::lines::{EngineLineCodec, DEFAULT_MAX_LINE_LENGTH};

/// Channel capacity for process events.
const EVENT_CAPACITY: usize = 256;

/// How long the exit notification waits for stdout to drain.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors produced by a [`ProcessHandle`].
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The executable does not exist or is not on `PATH`.
    #[error("engine executable not found: {0}")]
    NotFound(PathBuf),

    /// The OS refused to start the process.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The process has exited.
    #[error("engine process has exited")]
    Exited,

    /// The input stream was closed after an earlier failed write.
    #[error("engine input is closed")]
    InputClosed,

    /// Writing to the input stream failed.
    #[error("write to engine failed: {0}")]
    Io(#[from] io::Error),

    /// Writing to the input stream did not complete in time.
    #[error("write to engine timed out after {0:?}")]
    WriteTimeout(Duration),
}

/// Notifications from a running engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of stdout, delimiter removed.
    Line(String),
    /// The process exited with the given code (`None` when killed by a signal).
    Exit(Option<i32>),
    /// Waiting on the process failed.
    Error(String),
}

/// How the process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Normal exit or signal (`None` code).
    Exited(Option<i32>),
    /// The OS reported an error while waiting on the child.
    Failed(String),
}

/// What to run for an engine session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    /// Executable path or bare name looked up on `PATH`.
    pub program: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Working directory, inherited when `None`.
    pub working_dir: Option<PathBuf>,
    /// Cap on a single output line.
    pub max_line_length: usize,
}

impl EngineCommand {
    /// Creates a command with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    /// Sets the command-line arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the maximum output line length.
    pub fn max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }
}

/// Resolves the executable, failing early when it does not exist.
fn resolve_program(program: &Path) -> Result<PathBuf, ProcessError> {
    let is_bare_name = program.components().count() == 1 && !program.is_absolute();
    if is_bare_name {
        return which::which(program).map_err(|_| ProcessError::NotFound(program.to_path_buf()));
    }
    if program.exists() {
        Ok(program.to_path_buf())
    } else {
        Err(ProcessError::NotFound(program.to_path_buf()))
    }
}

/// Handle to one running engine process.
///
/// Dropping the handle kills the process.
pub struct ProcessHandle {
    program: PathBuf,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Spawns the engine and starts its I/O tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        command: &EngineCommand,
    ) -> Result<(Self, mpsc::Receiver<ProcessEvent>), ProcessError> {
        let program = resolve_program(&command.program)?;

        let mut cmd = Command::new(&program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        let label = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        let reader = stdout.map(|stdout| {
            tokio::spawn(read_stdout(
                stdout,
                EngineLineCodec::with_max_length(command.max_line_length),
                event_tx.clone(),
                label.clone(),
            ))
        });
        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(stderr, label.clone()));
        }
        tokio::spawn(wait_for_exit(child, kill_rx, reader, exit_tx, event_tx, label));

        tracing::debug!(program = %program.display(), pid = ?pid, "Spawned engine process");

        let handle = Self {
            program,
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            exit_rx,
        };

        Ok((handle, event_rx))
    }

    /// Returns the resolved executable path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns the OS process id, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns how the process ended, or `None` while it is running.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    /// Returns whether the process has exited.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Locks the input stream for one or more ordered writes.
    pub async fn lock_input(&self) -> InputGuard<'_> {
        InputGuard {
            stdin: self.stdin.lock().await,
            handle: self,
        }
    }

    /// Writes one line (a newline is appended) to the process input.
    pub async fn write_line(&self, line: &str, timeout: Duration) -> Result<(), ProcessError> {
        self.lock_input().await.write_line(line, timeout).await
    }

    /// Waits up to `timeout` for the process to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ProcessExit> {
        let mut rx = self.exit_rx.clone();
        // Bound to a local so the borrow of `rx` ends before `rx` does.
        let exit = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => exit.clone(),
            // Sender dropped: the wait task is gone, report what we have.
            Ok(Err(_)) => self.exit_status(),
            Err(_) => None,
        };
        exit
    }

    /// Asks the process to terminate (SIGTERM on Unix).
    ///
    /// Falls back to [`kill`](Self::kill) where signals are unavailable.
    pub fn terminate(&self) {
        if self.has_exited() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
                match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    Ok(()) => {
                        tracing::debug!(pid = pid, "Sent SIGTERM to engine");
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(pid = pid, error = %e, "SIGTERM failed, killing");
                    }
                }
            }
        }

        self.kill();
    }

    /// Forcibly kills the process. Idempotent.
    pub fn kill(&self) {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        if let Some(sender) = sender {
            // The wait task may already be gone if the process exited.
            let _ = sender.send(());
        }
    }
}

/// Exclusive access to a process's input stream.
///
/// Holding the guard keeps other writers out, so several writes (or a write
/// and some bookkeeping) happen as one ordered unit.
pub struct InputGuard<'a> {
    stdin: MutexGuard<'a, Option<ChildStdin>>,
    handle: &'a ProcessHandle,
}

impl InputGuard<'_> {
    /// Writes one line (a newline is appended), bounded by `timeout`.
    ///
    /// A timed-out write may have delivered part of the line, so the input is
    /// closed afterwards rather than risking a corrupted follow-up command.
    pub async fn write_line(&mut self, line: &str, timeout: Duration) -> Result<(), ProcessError> {
        if self.handle.has_exited() {
            return Err(ProcessError::Exited);
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ProcessError::InputClosed);
        };

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let write = async {
            stdin.write_all(&buf).await?;
            stdin.flush().await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                *self.stdin = None;
                Err(ProcessError::Exited)
            }
            Ok(Err(e)) => Err(ProcessError::Io(e)),
            Err(_) => {
                tracing::warn!(
                    pid = ?self.handle.pid,
                    timeout = ?timeout,
                    "Engine stopped reading input, closing it"
                );
                *self.stdin = None;
                Err(ProcessError::WriteTimeout(timeout))
            }
        }
    }
}

async fn read_stdout(
    stdout: ChildStdout,
    codec: EngineLineCodec,
    events: mpsc::Sender<ProcessEvent>,
    label: String,
) {
    let mut lines = FramedRead::new(stdout, codec);

    while let Some(item) = lines.next().await {
        match item {
            Ok(line) => {
                tracing::trace!(engine = %label, line = %line, "Engine output");
                if events.send(ProcessEvent::Line(line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(engine = %label, error = %e, "Error reading engine output");
                break;
            }
        }
    }

    tracing::debug!(engine = %label, "Engine stdout closed");
}

async fn drain_stderr(stderr: ChildStderr, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() && !line.contains("pthread") {
                    tracing::debug!(engine = %label, "stderr: {}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(engine = %label, error = %e, "Error reading engine stderr");
                break;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    reader: Option<tokio::task::JoinHandle<()>>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    events: mpsc::Sender<ProcessEvent>,
    label: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Either an explicit kill or the handle was dropped.
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(engine = %label, error = %e, "Kill failed, process likely gone");
            }
            child.wait().await
        }
    };

    let (exit, event) = match status {
        Ok(status) => {
            tracing::info!(engine = %label, code = ?status.code(), "Engine process exited");
            (ProcessExit::Exited(status.code()), ProcessEvent::Exit(status.code()))
        }
        Err(e) => {
            tracing::error!(engine = %label, error = %e, "Failed waiting on engine process");
            (ProcessExit::Failed(e.to_string()), ProcessEvent::Error(e.to_string()))
        }
    };

    // The exit is observable at once; the event waits behind remaining output.
    exit_tx.send_replace(Some(exit));

    if let Some(reader) = reader {
        if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await.is_err() {
            tracing::debug!(engine = %label, "Engine stdout still open after exit");
        }
    }

    let _ = events.send(event).await;
}
