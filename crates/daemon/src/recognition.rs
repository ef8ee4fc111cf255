//! Board image recognition proxy.
//!
//! Forwards an uploaded board photo to the remote recognition service and
//! hands its answer back untouched. The proxy keeps no state between calls.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use protocol::ErrorCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, ORIGIN, REFERER};
use reqwest::multipart::{Form, Part};
use thiserror::Error;

use crate::config::RecognitionConfig;

/// Multipart field carrying the image, both inbound and upstream.
pub const IMAGE_FIELD: &str = "image";

/// Filename used when the upload did not name one.
pub const DEFAULT_FILENAME: &str = "board.jpg";

const ACCEPT_VALUE: &str = "application/json, text/plain, */*";

/// Errors raised before or while talking to the recognition service.
#[derive(Error, Debug)]
pub enum RecognitionError {
    /// No image was uploaded, or it was empty.
    #[error("no image uploaded")]
    MissingImage,

    /// The image exceeds the upload limit.
    #[error("image is {size} bytes, the limit is {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// The recognition service could not be reached.
    #[error("recognition service unreachable: {0}")]
    Upstream(String),

    /// The recognition service answered with something that is not JSON.
    #[error("recognition service returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl RecognitionError {
    /// The wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RecognitionError::MissingImage => ErrorCode::BadRequest,
            RecognitionError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            RecognitionError::Upstream(_) | RecognitionError::InvalidResponse(_) => {
                ErrorCode::UpstreamError
            }
        }
    }
}

/// An uploaded image.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Bytes,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

impl ImageUpload {
    /// Wraps raw image bytes with no metadata.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            filename: None,
            content_type: None,
        }
    }

    /// Sets the original filename.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Sets the MIME type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// The recognition service's answer, to be relayed as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamReply {
    /// HTTP status to relay.
    pub status: u16,
    /// JSON body, byte for byte.
    pub body: Bytes,
}

impl UpstreamReply {
    /// Whether the upstream accepted the image.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body parsed as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Stateless forwarder to the recognition service.
#[derive(Debug, Clone)]
pub struct RecognitionProxy {
    client: reqwest::Client,
    endpoint: String,
    origin: String,
    max_upload_bytes: usize,
}

impl RecognitionProxy {
    /// Builds a proxy from configuration.
    pub fn new(config: &RecognitionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build recognition HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            origin: config.origin.trim_end_matches('/').to_string(),
            max_upload_bytes: config.max_upload_bytes,
        })
    }

    /// Where images are forwarded.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Largest accepted upload.
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Checks an upload against the limits without sending it.
    pub fn check(&self, upload: &ImageUpload) -> Result<(), RecognitionError> {
        if upload.bytes.is_empty() {
            return Err(RecognitionError::MissingImage);
        }
        if upload.bytes.len() > self.max_upload_bytes {
            return Err(RecognitionError::PayloadTooLarge {
                size: upload.bytes.len(),
                max: self.max_upload_bytes,
            });
        }
        Ok(())
    }

    /// Forwards an image and returns the service's answer.
    ///
    /// A non-2xx answer is not an error: its status is relayed along with the
    /// upstream JSON, or a `{code, msg, data}` body when the upstream sent
    /// something else.
    pub async fn forward(&self, upload: ImageUpload) -> Result<UpstreamReply, RecognitionError> {
        self.check(&upload)?;

        let size = upload.bytes.len();
        let filename = upload
            .filename
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

        tracing::info!(filename = %filename, size = size, "Forwarding image for recognition");

        let part = image_part(upload.bytes, filename, upload.content_type.as_deref());

        let form = Form::new().part(IMAGE_FIELD, part);

        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, ACCEPT_VALUE)
            .header(ORIGIN, &self.origin)
            .header(REFERER, format!("{}/", self.origin))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Recognition request failed");
                RecognitionError::Upstream(e.to_string())
            })?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));
        let body = response
            .bytes()
            .await
            .map_err(|e| RecognitionError::Upstream(e.to_string()))?;
        let parses = serde_json::from_slice::<serde_json::Value>(&body).is_ok();

        if status.is_success() {
            if !parses {
                return Err(RecognitionError::InvalidResponse(format!(
                    "expected JSON, got {} bytes{}",
                    body.len(),
                    if is_json { " of malformed JSON" } else { "" }
                )));
            }
            tracing::info!(status = status.as_u16(), "Recognition succeeded");
            return Ok(UpstreamReply {
                status: status.as_u16(),
                body,
            });
        }

        tracing::warn!(status = status.as_u16(), "Recognition service returned an error");

        let body = if parses {
            body
        } else {
            let reason = status.canonical_reason().unwrap_or("error");
            let fallback = serde_json::json!({
                "code": status.as_u16(),
                "msg": format!("recognition service error: {reason}"),
                "data": null,
            });
            Bytes::from(fallback.to_string())
        };

        Ok(UpstreamReply {
            status: status.as_u16(),
            body,
        })
    }
}

/// Builds the upstream form part, dropping a content type reqwest rejects.
fn image_part(bytes: Bytes, filename: String, content_type: Option<&str>) -> Part {
    let Some(mime) = content_type else {
        return Part::bytes(bytes.to_vec()).file_name(filename);
    };

    Part::bytes(bytes.to_vec())
        .file_name(filename.clone())
        .mime_str(mime)
        .unwrap_or_else(|e| {
            tracing::debug!(mime = %mime, error = %e, "Ignoring invalid upload content type");
            Part::bytes(bytes.to_vec()).file_name(filename)
        })
}
