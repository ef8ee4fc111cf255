//! # EngineHub Protocol Library
//!
//! Wire types shared by the EngineHub daemon and its clients.
//!
//! ## Overview
//!
//! The daemon exposes line-protocol chess engines over a small JSON API. This
//! crate holds the request and response bodies for that API and the error
//! codes every failure is reported with, so the service and the CLI client
//! agree on one definition.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{CommandRequest, ErrorBody, ErrorCode};
//!
//! let request = CommandRequest {
//!     session_id: "0190e0c4-0000-7000-8000-000000000000".to_string(),
//!     command: "isready".to_string(),
//!     timeout_ms: Some(1000),
//! };
//! let json = serde_json::to_string(&request).unwrap();
//! assert!(json.contains("\"sessionId\""));
//!
//! let body = ErrorBody::new(ErrorCode::NotFound, "session not found");
//! assert_eq!(body.code.http_status(), 404);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: API request and response bodies
//! - [`error`]: Error codes and client-side error type

pub mod error;
pub mod messages;

pub use error::{ErrorCode, ProtocolError, Result};
pub use messages::{
    CleanupRequest, CleanupResponse, CommandRequest, CommandResponse, ErrorBody, HealthResponse,
    InitializeRequest, InitializeResponse, RecognizeInfo, ReplyOutcome, SessionList,
    SessionSummary, API_VERSION,
};
