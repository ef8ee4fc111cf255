//! Engine sessions.
//!
//! A [`Session`] binds one engine process to the bookkeeping needed to answer
//! callers: the log of received lines, the last line, and the FIFO queue of
//! callers waiting for output.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use protocol::{ErrorCode, SessionSummary};
use thiserror::Error;
use tokio::sync::watch;

use super::process::{ProcessError, ProcessExit, ProcessHandle};
use super::replies::{lock, wait_for_reply, EngineReply, ReplyQueue};
use crate::config::EngineConfig;

/// Unique identifier for a session.
pub type SessionId = String;

/// Command sent to ask an engine to exit.
pub const QUIT_COMMAND: &str = "quit";

/// Grace period after a forced kill before giving up on the exit notification.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The engine could not be started.
    #[error("failed to start engine {path}: {reason}")]
    SpawnFailed { path: String, reason: String },

    /// The engine exited during the stabilization window.
    #[error("engine exited during startup ({status})")]
    EarlyExit {
        session_id: SessionId,
        status: SessionStatus,
    },

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's engine process has exited.
    #[error("engine process has terminated for session {0}")]
    ProcessNotRunning(SessionId),

    /// Writing to the engine failed.
    #[error("I/O error on session {session_id}: {reason}")]
    Io {
        session_id: SessionId,
        reason: String,
    },

    /// The command would be more than one protocol line.
    #[error("command must be a single line")]
    InvalidCommand,

    /// The configured session cap was reached.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),
}

impl SessionError {
    /// The wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::SpawnFailed { .. } => ErrorCode::SpawnFailed,
            SessionError::EarlyExit { .. } => ErrorCode::EarlyExit,
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::ProcessNotRunning(_) => ErrorCode::ProcessNotRunning,
            SessionError::Io { .. } => ErrorCode::IoError,
            SessionError::InvalidCommand => ErrorCode::BadRequest,
            SessionError::LimitReached(_) => ErrorCode::SessionLimit,
        }
    }
}

/// Status of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// The engine is running.
    Running,
    /// The engine exited with a code (`None` when ended by a signal).
    Exited(Option<i32>),
    /// The engine failed in a way the OS reported as an error.
    Failed(String),
}

impl SessionStatus {
    /// Whether the engine is still running.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionStatus::Running)
    }
}

impl From<ProcessExit> for SessionStatus {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Exited(code) => SessionStatus::Exited(code),
            ProcessExit::Failed(reason) => SessionStatus::Failed(reason),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Running => f.write_str("running"),
            SessionStatus::Exited(Some(code)) => write!(f, "exited with code {}", code),
            SessionStatus::Exited(None) => f.write_str("terminated by signal"),
            SessionStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-session behaviour taken from the engine configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound on one write to the engine.
    pub write_timeout: Duration,
    /// Drop blank output lines.
    pub skip_empty_lines: bool,
}

impl From<&EngineConfig> for SessionOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            write_timeout: config.write_timeout(),
            skip_empty_lines: config.skip_empty_lines,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// One engine process plus its protocol-level bookkeeping.
pub struct Session {
    /// Unique session identifier.
    id: SessionId,

    /// The engine process.
    process: ProcessHandle,

    /// Received lines and waiting callers.
    replies: Mutex<ReplyQueue>,

    /// Current status, observable by stabilization and shutdown waits.
    status: watch::Sender<SessionStatus>,

    /// Unix timestamp of creation.
    created_at: u64,

    options: SessionOptions,
}

impl Session {
    /// Wraps a spawned process.
    ///
    /// The caller is responsible for feeding the process events into
    /// [`on_line`](Self::on_line) and [`terminate`](Self::terminate).
    pub fn new(id: SessionId, process: ProcessHandle, options: SessionOptions) -> Self {
        let (status, _) = watch::channel(SessionStatus::Running);
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            id,
            process,
            replies: Mutex::new(ReplyQueue::new()),
            status,
            created_at,
            options,
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the engine executable.
    pub fn engine_path(&self) -> String {
        self.process.program().display().to_string()
    }

    /// Returns the process ID of the engine, if available.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Returns the current status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Returns whether the engine is still running.
    pub fn is_running(&self) -> bool {
        self.status.borrow().is_running() && !self.process.has_exited()
    }

    fn map_process_error(&self, err: ProcessError) -> SessionError {
        match err {
            ProcessError::Exited => SessionError::ProcessNotRunning(self.id.clone()),
            ProcessError::WriteTimeout(_) | ProcessError::InputClosed => {
                // The input is gone for good, so the engine is unusable.
                tracing::warn!(session_id = %self.id, error = %err, "Engine input lost, killing engine");
                self.process.kill();
                self.terminate(SessionStatus::Failed(err.to_string()));
                SessionError::Io {
                    session_id: self.id.clone(),
                    reason: err.to_string(),
                }
            }
            other => SessionError::Io {
                session_id: self.id.clone(),
                reason: other.to_string(),
            },
        }
    }

    /// Writes one command line to the engine.
    pub async fn write(&self, command: &str) -> Result<(), SessionError> {
        let command = normalize_command(command)?;
        if !self.is_running() {
            return Err(SessionError::ProcessNotRunning(self.id.clone()));
        }

        self.process
            .write_line(command, self.options.write_timeout)
            .await
            .map_err(|e| self.map_process_error(e))
    }

    /// Waits for the next line of output, for at most `timeout`.
    ///
    /// On timeout the last known line is returned. Never fails.
    pub async fn await_response(&self, timeout: Duration) -> EngineReply {
        let queued = lock(&self.replies).enqueue();
        match queued {
            Ok((ticket, rx)) => wait_for_reply(&self.replies, ticket, rx, timeout).await,
            Err(reply) => reply,
        }
    }

    /// Sends a command and waits for the next line of output.
    ///
    /// The waiter is queued while the input lock is held and before the
    /// command is written, so a fast reply cannot slip past it and concurrent
    /// requests are written in the order their waiters were queued.
    pub async fn request(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<EngineReply, SessionError> {
        let command = normalize_command(command)?;
        let mut input = self.process.lock_input().await;

        if !self.is_running() {
            return Err(SessionError::ProcessNotRunning(self.id.clone()));
        }

        let queued = lock(&self.replies).enqueue();
        let (ticket, rx) = match queued {
            Ok(queued) => queued,
            Err(_) => return Err(SessionError::ProcessNotRunning(self.id.clone())),
        };

        if let Err(e) = input.write_line(command, self.options.write_timeout).await {
            lock(&self.replies).cancel(ticket);
            return Err(self.map_process_error(e));
        }
        drop(input);

        tracing::debug!(session_id = %self.id, command = %command, "Sent command to engine");

        Ok(wait_for_reply(&self.replies, ticket, rx, timeout).await)
    }

    /// Handles one line of engine output.
    pub fn on_line(&self, line: String) {
        if self.options.skip_empty_lines && line.trim().is_empty() {
            return;
        }

        tracing::debug!(session_id = %self.id, line = %line, "Engine output");
        lock(&self.replies).push_line(line);
    }

    /// Marks the engine as ended and resolves every waiter.
    ///
    /// Returns the number of waiters that were resolved. Calling this more
    /// than once keeps the first status.
    pub fn terminate(&self, status: SessionStatus) -> usize {
        self.status.send_if_modified(|current| {
            if current.is_running() {
                *current = status;
                true
            } else {
                false
            }
        });

        let resolved = lock(&self.replies).close();
        if resolved > 0 {
            tracing::debug!(
                session_id = %self.id,
                resolved = resolved,
                "Resolved pending waiters on engine termination"
            );
        }
        resolved
    }

    /// Waits up to `timeout` for the session to stop running.
    ///
    /// Returns the final status, or `None` if it is still running.
    pub async fn wait_terminated(&self, timeout: Duration) -> Option<SessionStatus> {
        let mut rx = self.status.subscribe();
        // Bound to a local so the borrow of `rx` ends before `rx` does.
        let status = match tokio::time::timeout(timeout, rx.wait_for(|s| !s.is_running())).await {
            Ok(Ok(status)) => Some(status.clone()),
            Ok(Err(_)) | Err(_) => None,
        };
        status
    }

    /// Waits up to `timeout` for the engine process itself to exit.
    ///
    /// Unlike [`wait_terminated`](Self::wait_terminated) this does not wait
    /// for buffered output to be delivered first.
    pub async fn wait_exited(&self, timeout: Duration) -> Option<SessionStatus> {
        self.process.wait_exit(timeout).await.map(SessionStatus::from)
    }

    /// Stops the engine: `quit`, then SIGTERM, then a forced kill.
    ///
    /// Each step is given `grace` to take effect. Pending waiters are resolved
    /// once the process is gone.
    pub async fn shutdown(&self, grace: Duration) {
        if !self.process.has_exited() {
            if let Err(e) = self.write(QUIT_COMMAND).await {
                tracing::debug!(session_id = %self.id, error = %e, "Could not send quit, terminating");
            }

            if self.process.wait_exit(grace).await.is_none() {
                self.process.terminate();
                if self.process.wait_exit(grace).await.is_none() {
                    tracing::warn!(session_id = %self.id, "Engine ignored SIGTERM, killing");
                    self.process.kill();
                    let _ = self.process.wait_exit(KILL_WAIT).await;
                }
            }
        }

        let status = self
            .process
            .exit_status()
            .map(SessionStatus::from)
            .unwrap_or(SessionStatus::Exited(None));
        self.terminate(status);
    }

    /// Forcibly kills the engine without the graceful steps.
    pub fn kill(&self) {
        self.process.kill();
    }

    /// The most recent line, or empty.
    pub fn last_line(&self) -> String {
        lock(&self.replies).last_line().to_string()
    }

    /// The last `n` lines received.
    pub fn recent_output(&self, n: usize) -> Vec<String> {
        lock(&self.replies).recent(n).to_vec()
    }

    /// Every line received so far.
    pub fn log(&self) -> Vec<String> {
        lock(&self.replies).log().to_vec()
    }

    /// Number of callers waiting for output.
    pub fn pending_count(&self) -> usize {
        lock(&self.replies).pending_len()
    }

    /// Snapshot for listings.
    pub fn summary(&self) -> SessionSummary {
        let replies = lock(&self.replies);
        SessionSummary {
            id: self.id.clone(),
            engine_path: self.engine_path(),
            pid: self.pid(),
            created_at: self.created_at,
            running: self.is_running(),
            lines_received: replies.log().len(),
            pending: replies.pending_len(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("status", &self.status())
            .finish()
    }
}

/// Strips one trailing line terminator and rejects embedded ones.
fn normalize_command(command: &str) -> Result<&str, SessionError> {
    let command = command
        .strip_suffix('\n')
        .map(|c| c.strip_suffix('\r').unwrap_or(c))
        .unwrap_or(command);

    if command.contains(['\n', '\r']) {
        return Err(SessionError::InvalidCommand);
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::process::{EngineCommand, ProcessEvent};
    use protocol::ReplyOutcome;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    /// Spawns a session and pumps its events the way the registry does.
    fn spawn_session(command: EngineCommand) -> Arc<Session> {
        let (process, mut events) = ProcessHandle::spawn(&command).unwrap();
        let session = Arc::new(Session::new(
            "test-session".to_string(),
            process,
            SessionOptions::default(),
        ));

        let pump = Arc::clone(&session);
        tokio::spawn(async move {
            let mut status = SessionStatus::Exited(None);
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Line(line) => pump.on_line(line),
                    ProcessEvent::Exit(code) => {
                        status = SessionStatus::Exited(code);
                        break;
                    }
                    ProcessEvent::Error(e) => {
                        status = SessionStatus::Failed(e);
                        break;
                    }
                }
            }
            pump.terminate(status);
        });

        session
    }

    fn echo_engine() -> Arc<Session> {
        spawn_session(EngineCommand::new("cat"))
    }

    fn silent_engine() -> Arc<Session> {
        spawn_session(EngineCommand::new("/bin/sh").args(["-c", "cat > /dev/null"]))
    }

    #[test]
    fn test_normalize_command() {
        assert_eq!(normalize_command("isready").unwrap(), "isready");
        assert_eq!(normalize_command("isready\n").unwrap(), "isready");
        assert_eq!(normalize_command("isready\r\n").unwrap(), "isready");
        assert!(matches!(
            normalize_command("go\nquit"),
            Err(SessionError::InvalidCommand)
        ));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SessionError::NotFound("x".to_string()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            SessionError::ProcessNotRunning("x".to_string()).code(),
            ErrorCode::ProcessNotRunning
        );
        assert_eq!(SessionError::LimitReached(2).code(), ErrorCode::SessionLimit);
        assert_eq!(SessionError::InvalidCommand.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::Exited(Some(1)).to_string(), "exited with code 1");
        assert_eq!(SessionStatus::Exited(None).to_string(), "terminated by signal");
        assert!(!SessionStatus::Failed("x".to_string()).is_running());
    }

    #[tokio::test]
    async fn test_request_receives_echo() {
        let session = echo_engine();

        let reply = session.request("isready", WAIT).await.unwrap();
        assert_eq!(reply.line, "isready");
        assert_eq!(reply.outcome, ReplyOutcome::Line);
        assert_eq!(session.last_line(), "isready");

        session.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_write_then_await_response() {
        let session = echo_engine();

        session.write("uci").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pending = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.await_response(WAIT).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.write("ucinewgame").await.unwrap();

        let reply = pending.await.unwrap();
        assert_eq!(reply.line, "ucinewgame");
        assert_eq!(session.log(), vec!["uci", "ucinewgame"]);

        session.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_replies() {
        let session = echo_engine();

        let (a, b, c) = tokio::join!(
            session.request("position startpos", WAIT),
            session.request("go depth 1", WAIT),
            session.request("stop", WAIT),
        );

        assert_eq!(a.unwrap().line, "position startpos");
        assert_eq!(b.unwrap().line, "go depth 1");
        assert_eq!(c.unwrap().line, "stop");

        session.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_timeout_returns_last_line() {
        let session = silent_engine();

        let start = std::time::Instant::now();
        let reply = session
            .request("go", Duration::from_millis(200))
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_millis(200) + Duration::from_secs(1));
        assert_eq!(reply.outcome, ReplyOutcome::TimedOut);
        assert_eq!(reply.line, "");
        assert_eq!(session.pending_count(), 0);

        session.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_kill_resolves_pending_waiters() {
        let session = silent_engine();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.await_response(Duration::from_secs(30)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.pending_count(), 3);

        let start = std::time::Instant::now();
        session.kill();

        for waiter in waiters {
            let reply = waiter.await.unwrap();
            assert_eq!(reply.outcome, ReplyOutcome::Terminated);
        }
        assert!(start.elapsed() < WAIT);
        assert_eq!(session.pending_count(), 0);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_write_after_exit_is_not_running() {
        let session = spawn_session(EngineCommand::new("/bin/sh").args(["-c", "exit 0"]));

        let status = session.wait_terminated(WAIT).await;
        assert_eq!(status, Some(SessionStatus::Exited(Some(0))));

        let result = session.write("isready").await;
        assert!(matches!(result, Err(SessionError::ProcessNotRunning(_))));

        let reply = session.await_response(WAIT).await;
        assert_eq!(reply.outcome, ReplyOutcome::Terminated);
    }

    #[tokio::test]
    async fn test_empty_lines_skipped() {
        let session = spawn_session(
            EngineCommand::new("/bin/sh").args(["-c", "printf 'a\\n\\n \\nb\\n'; cat > /dev/null"]),
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(session.log(), vec!["a", "b"]);

        session.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_shutdown_sends_quit() {
        // Exits cleanly on "quit", like a real engine.
        let session = spawn_session(EngineCommand::new("/bin/sh").args([
            "-c",
            "while read line; do [ \"$line\" = quit ] && exit 7; done",
        ]));

        session.shutdown(Duration::from_secs(2)).await;
        assert_eq!(session.status(), SessionStatus::Exited(Some(7)));
    }

    #[tokio::test]
    async fn test_shutdown_forces_stubborn_engine() {
        let session = spawn_session(EngineCommand::new("/bin/sh").args([
            "-c",
            "trap '' TERM; while :; do sleep 1; done",
        ]));

        let start = std::time::Instant::now();
        session.shutdown(Duration::from_millis(100)).await;
        assert!(!session.is_running());
        assert!(start.elapsed() < WAIT);
    }

    #[tokio::test]
    async fn test_summary() {
        let session = echo_engine();
        session.request("uci", WAIT).await.unwrap();

        let summary = session.summary();
        assert_eq!(summary.id, "test-session");
        assert!(summary.running);
        assert_eq!(summary.lines_received, 1);
        assert_eq!(summary.pending, 0);
        assert!(summary.engine_path.ends_with("cat"));

        session.shutdown(Duration::from_millis(200)).await;
    }
}
