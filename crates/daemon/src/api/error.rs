//! API error handling

use std::fmt;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::FromRequest;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{ErrorBody, ErrorCode};

use crate::recognition::RecognitionError;
use crate::session::SessionError;

/// Error returned by every handler, rendered as an [`ErrorBody`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub available_sessions: Option<Vec<String>>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            available_sessions: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Attaches the live session ids, for errors a fresh session fixes.
    pub fn with_available_sessions(mut self, sessions: Vec<String>) -> Self {
        self.available_sessions = Some(sessions);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = %self.code, error = %self.message, "Request failed");
        } else {
            tracing::debug!(code = %self.code, error = %self.message, "Request rejected");
        }

        let mut body = ErrorBody::new(self.code, self.message);
        if let Some(sessions) = self.available_sessions {
            body = body.with_available_sessions(sessions);
        }

        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}

impl From<RecognitionError> for ApiError {
    fn from(err: RecognitionError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::new(ErrorCode::PayloadTooLarge, err.body_text())
        } else {
            ApiError::bad_request(err.body_text())
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(format!("{:#}", err))
    }
}

/// JSON extractor whose rejections use the API error body.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_code() {
        let cases = [
            (ErrorCode::NotFound, StatusCode::NOT_FOUND),
            (ErrorCode::ProcessNotRunning, StatusCode::NOT_FOUND),
            (ErrorCode::SessionLimit, StatusCode::TOO_MANY_REQUESTS),
            (ErrorCode::PayloadTooLarge, StatusCode::PAYLOAD_TOO_LARGE),
            (ErrorCode::UpstreamError, StatusCode::BAD_GATEWAY),
            (ErrorCode::SpawnFailed, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (code, status) in cases {
            assert_eq!(ApiError::new(code, "x").status_code(), status);
        }
    }

    #[test]
    fn test_from_session_error() {
        let err = ApiError::from(SessionError::NotFound("abc".to_string()));
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("abc"));
        assert!(err.available_sessions.is_none());
    }

    #[test]
    fn test_from_recognition_error() {
        let err = ApiError::from(RecognitionError::PayloadTooLarge { size: 2, max: 1 });
        assert_eq!(err.code, ErrorCode::PayloadTooLarge);
    }

    #[tokio::test]
    async fn test_into_response_body() {
        let response = ApiError::new(ErrorCode::NotFound, "session not found: abc")
            .with_available_sessions(vec!["s1".to_string()])
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert!(!body.success);
        assert_eq!(body.code, ErrorCode::NotFound);
        assert_eq!(body.error, "session not found: abc");
        assert_eq!(body.available_sessions, Some(vec!["s1".to_string()]));
    }
}
