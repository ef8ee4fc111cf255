//! HTTP handlers.

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use protocol::{
    CleanupRequest, CleanupResponse, CommandRequest, CommandResponse, HealthResponse,
    InitializeRequest, InitializeResponse, RecognizeInfo, SessionList, API_VERSION,
};

use super::error::{ApiError, ApiJson, ApiResult};
use crate::recognition::{ImageUpload, RecognitionError, IMAGE_FIELD};
use crate::service::EngineService;
use crate::session::SessionError;

/// Room for multipart boundaries and part headers on top of the image itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Engine session routes.
pub fn engine_routes() -> Router<EngineService> {
    Router::new()
        .route("/api/engine/initialize", post(initialize))
        .route("/api/engine/command", post(command))
        .route("/api/engine/cleanup", post(cleanup))
        .route("/api/engine/sessions", get(list_sessions))
}

/// Image recognition routes.
pub fn recognition_routes(max_upload_bytes: usize) -> Router<EngineService> {
    Router::new()
        .route(
            "/api/recognize",
            post(recognize).layer(DefaultBodyLimit::max(
                max_upload_bytes.saturating_add(MULTIPART_OVERHEAD),
            )),
        )
        .route("/api/recognize/info", get(recognize_info))
}

/// Health route.
pub fn health_routes() -> Router<EngineService> {
    Router::new().route("/health", get(health))
}

/// Adds the live session ids to errors that a fresh session resolves.
fn session_error(service: &EngineService, err: SessionError) -> ApiError {
    let api_error = ApiError::from(err);
    if api_error.code.requires_new_session() {
        api_error.with_available_sessions(service.registry().ids())
    } else {
        api_error
    }
}

/// POST /api/engine/initialize - Start an engine session
async fn initialize(
    State(service): State<EngineService>,
    ApiJson(request): ApiJson<InitializeRequest>,
) -> ApiResult<Json<InitializeResponse>> {
    let session = service
        .registry()
        .create(request.engine_path.as_deref())
        .await
        .map_err(ApiError::from)?;

    Ok(Json(InitializeResponse {
        success: true,
        session_id: session.id().clone(),
        engine_path: session.engine_path(),
        pid: session.pid(),
        message: "engine initialized".to_string(),
    }))
}

/// POST /api/engine/command - Send one command and return the next line
async fn command(
    State(service): State<EngineService>,
    ApiJson(request): ApiJson<CommandRequest>,
) -> ApiResult<Json<CommandResponse>> {
    let reply = service
        .dispatcher()
        .send_with_default(&request.session_id, &request.command, request.timeout_ms)
        .await
        .map_err(|e| session_error(&service, e))?;

    Ok(Json(CommandResponse {
        success: true,
        response: reply.reply.line,
        outcome: reply.reply.outcome,
        command: reply.command,
        recent_output: reply.recent_output.join("\n"),
    }))
}

/// POST /api/engine/cleanup - Stop a session; unknown ids are not an error
async fn cleanup(
    State(service): State<EngineService>,
    ApiJson(request): ApiJson<CleanupRequest>,
) -> Json<CleanupResponse> {
    let outcome = service.registry().remove(&request.session_id).await;

    Json(CleanupResponse {
        success: true,
        cleared_session: request.session_id,
        removed: outcome == crate::session::RemoveOutcome::Removed,
    })
}

/// GET /api/engine/sessions - List live sessions
async fn list_sessions(State(service): State<EngineService>) -> Json<SessionList> {
    Json(SessionList {
        success: true,
        sessions: service.registry().list(),
    })
}

/// POST /api/recognize - Forward a board image to the recognition service
async fn recognize(
    State(service): State<EngineService>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Response> {
    let mut multipart = multipart?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;
        upload = Some(ImageUpload {
            bytes,
            filename,
            content_type,
        });
        break;
    }

    let upload = upload.ok_or(RecognitionError::MissingImage)?;
    let reply = service.recognizer().forward(upload).await?;
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);

    Ok((
        status,
        [(header::CONTENT_TYPE, "application/json")],
        reply.body,
    )
        .into_response())
}

/// GET /api/recognize/info - Describe the recognition route
async fn recognize_info(State(service): State<EngineService>) -> Json<RecognizeInfo> {
    Json(RecognizeInfo {
        status: "ok".to_string(),
        endpoint: "POST /api/recognize".to_string(),
        method: "multipart/form-data".to_string(),
        field: IMAGE_FIELD.to_string(),
        max_file_size: service.recognizer().max_upload_bytes(),
        upstream: service.recognizer().endpoint().to_string(),
    })
}

/// GET /health - Liveness and basic counters
async fn health(State(service): State<EngineService>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: API_VERSION,
        uptime_secs: service.uptime_secs(),
        session_count: service.registry().count(),
    })
}
