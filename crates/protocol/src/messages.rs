//! Request and response bodies for the EngineHub HTTP API.
//!
//! All bodies are JSON with camelCase field names. Successful responses carry
//! `success: true`; failures use [`ErrorBody`].

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProtocolError};

/// Current API version, reported by the health endpoint.
pub const API_VERSION: u8 = 1;

/// How a command reply was resolved.
///
/// The engine protocol carries no request identifiers, so a `Line` reply is
/// simply the next line the engine printed after the command was queued. It
/// may be an intermediate progress line rather than the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// A fresh line arrived before the timeout.
    Line,
    /// Nothing arrived in time; the reply is the last known line.
    TimedOut,
    /// The engine process ended while the caller was waiting.
    Terminated,
}

// Session lifecycle

/// Request to start an engine session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    /// Engine executable. Falls back to the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_path: Option<String>,
}

/// Response confirming a session was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// Always `true`.
    pub success: bool,
    /// Identifier to use for subsequent commands.
    pub session_id: String,
    /// The executable that was started.
    pub engine_path: String,
    /// Process ID of the engine, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Human-readable status.
    pub message: String,
}

/// Request to send one command line to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Target session.
    pub session_id: String,
    /// Raw command text, without the trailing newline.
    pub command: String,
    /// How long to wait for a reply, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    /// Always `true`; timeouts are not failures.
    pub success: bool,
    /// The reply line, possibly empty.
    pub response: String,
    /// How the reply was resolved.
    pub outcome: ReplyOutcome,
    /// The command that was sent.
    pub command: String,
    /// The most recent engine output lines, newline-joined.
    pub recent_output: String,
}

/// Request to stop a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    /// Session to stop.
    pub session_id: String,
}

/// Acknowledgment of a cleanup request. Cleanup never fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    /// Always `true`.
    pub success: bool,
    /// The id that was requested.
    pub cleared_session: String,
    /// Whether a live session was actually removed.
    pub removed: bool,
}

/// Summary of one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Engine executable.
    pub engine_path: String,
    /// Engine process ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,
    /// Whether the engine process is still alive.
    pub running: bool,
    /// Number of lines received so far.
    pub lines_received: usize,
    /// Number of callers currently waiting for output.
    pub pending: usize,
}

/// List of live sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionList {
    /// Always `true`.
    pub success: bool,
    /// One entry per session.
    pub sessions: Vec<SessionSummary>,
}

/// Health check payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"` while the service is serving.
    pub status: String,
    /// Crate version of the service.
    pub version: String,
    /// API version.
    pub api_version: u8,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Number of live sessions.
    pub session_count: usize,
}

/// Description of the image recognition route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizeInfo {
    /// `"ok"` while the route is available.
    pub status: String,
    /// Method and path of the route.
    pub endpoint: String,
    /// Expected request encoding.
    pub method: String,
    /// Multipart field holding the image.
    pub field: String,
    /// Largest accepted upload, in bytes.
    pub max_file_size: usize,
    /// Where images are forwarded.
    pub upstream: String,
}

/// Failure body returned with every non-2xx status produced by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Always `false`.
    pub success: bool,
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub error: String,
    /// Live session ids, included when a lookup failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_sessions: Option<Vec<String>>,
}

impl ErrorBody {
    /// Creates an error body.
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            error: error.into(),
            available_sessions: None,
        }
    }

    /// Attaches the list of live session ids.
    pub fn with_available_sessions(mut self, sessions: Vec<String>) -> Self {
        self.available_sessions = Some(sessions);
        self
    }
}

impl From<ErrorBody> for ProtocolError {
    fn from(body: ErrorBody) -> Self {
        ProtocolError::Api {
            code: body.code,
            message: body.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_request_optional_path() {
        let req: InitializeRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.engine_path, None);

        let req: InitializeRequest =
            serde_json::from_str(r#"{"enginePath":"/opt/pikafish"}"#).unwrap();
        assert_eq!(req.engine_path.as_deref(), Some("/opt/pikafish"));

        let json = serde_json::to_string(&InitializeRequest::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_command_request_camel_case() {
        let req: CommandRequest = serde_json::from_str(
            r#"{"sessionId":"abc","command":"isready","timeoutMs":250}"#,
        )
        .unwrap();
        assert_eq!(req.session_id, "abc");
        assert_eq!(req.command, "isready");
        assert_eq!(req.timeout_ms, Some(250));
    }

    #[test]
    fn test_command_response_wire_format() {
        let resp = CommandResponse {
            success: true,
            response: "readyok".to_string(),
            outcome: ReplyOutcome::Line,
            command: "isready".to_string(),
            recent_output: "uciok\nreadyok".to_string(),
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["outcome"], "line");
        assert_eq!(value["recentOutput"], "uciok\nreadyok");
    }

    #[test]
    fn test_reply_outcome_wire_names() {
        assert_eq!(
            serde_json::to_string(&ReplyOutcome::TimedOut).unwrap(),
            r#""timed_out""#
        );
        assert_eq!(
            serde_json::to_string(&ReplyOutcome::Terminated).unwrap(),
            r#""terminated""#
        );
    }

    #[test]
    fn test_error_body_omits_empty_sessions() {
        let body = ErrorBody::new(ErrorCode::IoError, "broken pipe");
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["code"], "IO_ERROR");
        assert!(value.get("availableSessions").is_none());

        let body = ErrorBody::new(ErrorCode::NotFound, "gone")
            .with_available_sessions(vec!["a".to_string()]);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["availableSessions"][0], "a");
    }

    #[test]
    fn test_error_body_into_protocol_error() {
        let err: ProtocolError = ErrorBody::new(ErrorCode::EarlyExit, "exited").into();
        assert_eq!(err.code(), Some(ErrorCode::EarlyExit));
    }
}
