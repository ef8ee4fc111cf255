//! HTTP client for a running service.
//!
//! Used by the `sessions` CLI subcommands, and handy in integration tests.

use std::time::Duration;

use protocol::{
    CleanupRequest, CleanupResponse, CommandRequest, CommandResponse, ErrorBody, ErrorCode,
    HealthResponse, InitializeRequest, InitializeResponse, ProtocolError, SessionList,
    SessionSummary,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Default per-request timeout. Command waits are bounded server-side.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Client-side errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The service could not be reached.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with an error, or with an unexpected body.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// The service's error code, if it sent one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Protocol(e) => e.code(),
            ClientError::Http(_) => None,
        }
    }
}

/// Client for the engine service API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Creates a client for the service at `base_url` (e.g. `http://127.0.0.1:3001`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// The service URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.http.get(self.url(path)).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        let bytes = response.bytes().await?;

        if status.is_success() {
            return serde_json::from_slice(&bytes)
                .map_err(|e| ClientError::Protocol(ProtocolError::from(e)));
        }

        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => Err(ClientError::Protocol(body.into())),
            Err(_) => Err(ClientError::Protocol(ProtocolError::Api {
                code: ErrorCode::Internal,
                message: format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(&bytes).trim()
                ),
            })),
        }
    }

    /// Starts a session, optionally with a specific engine.
    pub async fn initialize(
        &self,
        engine_path: Option<String>,
    ) -> Result<InitializeResponse, ClientError> {
        self.post("/api/engine/initialize", &InitializeRequest { engine_path })
            .await
    }

    /// Sends one command and returns the reply.
    pub async fn command(
        &self,
        session_id: &str,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResponse, ClientError> {
        let request = CommandRequest {
            session_id: session_id.to_string(),
            command: command.to_string(),
            timeout_ms,
        };
        self.post("/api/engine/command", &request).await
    }

    /// Stops a session.
    pub async fn cleanup(&self, session_id: &str) -> Result<CleanupResponse, ClientError> {
        let request = CleanupRequest {
            session_id: session_id.to_string(),
        };
        self.post("/api/engine/cleanup", &request).await
    }

    /// Lists live sessions.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, ClientError> {
        let list: SessionList = self.get("/api/engine/sessions").await?;
        Ok(list.sessions)
    }

    /// Fetches service health.
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get("/health").await
    }
}
