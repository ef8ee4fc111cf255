//! Error types for the protocol crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error codes carried in every failed API response.
///
/// Each code maps to exactly one HTTP status so that clients can branch on
/// either the status line or the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Session errors
    /// The engine executable is missing or the OS refused to start it.
    SpawnFailed,
    /// The engine exited during the stabilization window.
    EarlyExit,
    /// No session is registered under the given id.
    NotFound,
    /// The session exists but its engine process has already exited.
    ProcessNotRunning,
    /// Writing to the engine's input failed or timed out.
    IoError,
    /// The configured session cap has been reached.
    SessionLimit,

    // Request errors
    /// The request body was malformed or missing a field.
    BadRequest,
    /// The uploaded payload exceeds the configured limit.
    PayloadTooLarge,

    // Upstream / server errors
    /// The recognition endpoint could not be reached or answered garbage.
    UpstreamError,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    /// HTTP status code used when this error is returned over the API.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::SpawnFailed => 500,
            ErrorCode::EarlyExit => 500,
            ErrorCode::NotFound => 404,
            ErrorCode::ProcessNotRunning => 404,
            ErrorCode::IoError => 500,
            ErrorCode::SessionLimit => 429,
            ErrorCode::BadRequest => 400,
            ErrorCode::PayloadTooLarge => 413,
            ErrorCode::UpstreamError => 502,
            ErrorCode::Internal => 500,
        }
    }

    /// Wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::EarlyExit => "EARLY_EXIT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ProcessNotRunning => "PROCESS_NOT_RUNNING",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::SessionLimit => "SESSION_LIMIT",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether the caller can recover by starting a fresh session.
    pub fn requires_new_session(self) -> bool {
        matches!(
            self,
            ErrorCode::NotFound | ErrorCode::ProcessNotRunning | ErrorCode::EarlyExit
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol error type covering client-side failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a request body.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a response body.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The service answered with a typed error.
    #[error("{code}: {message}")]
    Api {
        /// Error code reported by the service.
        code: ErrorCode,
        /// Human-readable message reported by the service.
        message: String,
    },
}

impl ProtocolError {
    /// Returns the service error code, if this error came from the service.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ProtocolError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::ProcessNotRunning).unwrap();
        assert_eq!(json, r#""PROCESS_NOT_RUNNING""#);

        let code: ErrorCode = serde_json::from_str(r#""SESSION_LIMIT""#).unwrap();
        assert_eq!(code, ErrorCode::SessionLimit);
    }

    #[test]
    fn test_display_matches_wire_format() {
        for code in [
            ErrorCode::SpawnFailed,
            ErrorCode::EarlyExit,
            ErrorCode::NotFound,
            ErrorCode::IoError,
            ErrorCode::UpstreamError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.to_string());
        }
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::ProcessNotRunning.http_status(), 404);
        assert_eq!(ErrorCode::PayloadTooLarge.http_status(), 413);
        assert_eq!(ErrorCode::SessionLimit.http_status(), 429);
        assert_eq!(ErrorCode::UpstreamError.http_status(), 502);
        assert_eq!(ErrorCode::SpawnFailed.http_status(), 500);
    }

    #[test]
    fn test_requires_new_session() {
        assert!(ErrorCode::NotFound.requires_new_session());
        assert!(ErrorCode::ProcessNotRunning.requires_new_session());
        assert!(!ErrorCode::IoError.requires_new_session());
        assert!(!ErrorCode::BadRequest.requires_new_session());
    }

    #[test]
    fn test_api_error_display() {
        let err = ProtocolError::Api {
            code: ErrorCode::NotFound,
            message: "session not found: abc".to_string(),
        };
        assert_eq!(err.to_string(), "NOT_FOUND: session not found: abc");
        assert_eq!(err.code(), Some(ErrorCode::NotFound));
    }

    #[test]
    fn test_from_json_error_is_deserialization() {
        let err = serde_json::from_str::<ErrorCode>("{").unwrap_err();
        let err: ProtocolError = err.into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
        assert_eq!(err.code(), None);
    }
}
