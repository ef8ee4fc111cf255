//! Command dispatch: one command in, one line of output back.

use std::sync::Arc;
use std::time::Duration;

use protocol::ReplyOutcome;

use super::engine::SessionError;
use super::registry::SessionRegistry;
use super::replies::EngineReply;

/// The answer to one dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    /// The line that answered the command.
    pub reply: EngineReply,
    /// The command as written to the engine.
    pub command: String,
    /// The most recent lines of output, oldest first.
    pub recent_output: Vec<String>,
}

impl CommandReply {
    /// The answering line.
    pub fn line(&self) -> &str {
        &self.reply.line
    }

    /// How the reply was obtained.
    pub fn outcome(&self) -> ReplyOutcome {
        self.reply.outcome
    }
}

/// Routes commands to sessions and collects their replies.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
}

impl CommandDispatcher {
    /// Creates a dispatcher over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry commands are routed through.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Sends `command` to session `id` and waits up to `timeout` for a reply.
    ///
    /// A timeout is not an error: the reply then carries the last known line.
    /// A session whose engine has exited is evicted and reported as not
    /// running.
    pub async fn send(
        &self,
        id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandReply, SessionError> {
        let session = self.registry.get(id)?;

        if !session.is_running() {
            self.registry.evict(id, &session);
            return Err(SessionError::ProcessNotRunning(id.to_string()));
        }

        let command = command.trim_end_matches(['\r', '\n']);
        let reply = match session.request(command, timeout).await {
            Ok(reply) => reply,
            Err(e @ SessionError::ProcessNotRunning(_)) => {
                self.registry.evict(id, &session);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Failed to send command to engine");
                if !session.is_running() {
                    self.registry.evict(id, &session);
                }
                return Err(e);
            }
        };

        match reply.outcome {
            ReplyOutcome::Line => {}
            ReplyOutcome::TimedOut => {
                tracing::debug!(
                    session_id = %id,
                    command = %command,
                    timeout_ms = timeout.as_millis() as u64,
                    "No engine output before timeout, using last line"
                );
            }
            ReplyOutcome::Terminated => {
                tracing::info!(session_id = %id, command = %command, "Engine ended while awaiting reply");
            }
        }

        Ok(CommandReply {
            reply,
            command: command.to_string(),
            recent_output: session.recent_output(self.registry.config().recent_lines),
        })
    }

    /// Like [`send`](Self::send), resolving the timeout from configuration.
    ///
    /// `timeout_ms` of `None` or zero means the configured default; larger
    /// values are capped at the configured maximum.
    pub async fn send_with_default(
        &self,
        id: &str,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<CommandReply, SessionError> {
        let timeout = self.registry.config().reply_timeout(timeout_ms);
        self.send(id, command, timeout).await
    }
}
