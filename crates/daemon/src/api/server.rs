//! HTTP server: binding, routing, and graceful shutdown.

use std::io;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::routes::{engine_routes, health_routes, recognition_routes};
use crate::service::EngineService;

/// Builds the application router over `service`.
pub fn router(service: EngineService) -> Router {
    let max_upload = service.config().recognition.max_upload_bytes;

    Router::new()
        .merge(engine_routes())
        .merge(recognition_routes(max_upload))
        .merge(health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(service)
}

/// Permissive CORS, the browser front end is served from elsewhere.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// A bound, not yet serving, API server.
pub struct ApiServer {
    service: EngineService,
    listener: TcpListener,
}

impl ApiServer {
    /// Binds the configured address.
    ///
    /// When the port is taken, the following ports are tried, up to the
    /// configured number of attempts. Port 0 binds an ephemeral port.
    pub async fn bind(service: EngineService) -> Result<Self> {
        let host = service.config().server.host.clone();
        let port = service.config().server.port;
        let attempts = if port == 0 {
            1
        } else {
            service.config().server.port_attempts.max(1)
        };

        let mut last_error = None;
        for offset in 0..attempts {
            let Some(candidate) = port.checked_add(offset) else {
                break;
            };

            match TcpListener::bind((host.as_str(), candidate)).await {
                Ok(listener) => {
                    if offset > 0 {
                        tracing::warn!(
                            requested = port,
                            port = candidate,
                            "Requested port in use, using the next free one"
                        );
                    }
                    return Ok(Self { service, listener });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    tracing::debug!(port = candidate, "Port in use");
                    last_error = Some(e);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to bind {}:{}", host, candidate));
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no port available"));
        Err(error).with_context(|| {
            format!(
                "No free port on {} in {}..{}",
                host,
                port,
                port.saturating_add(attempts)
            )
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read bound address")
    }

    /// Serves requests until `shutdown` is cancelled.
    ///
    /// In-flight requests are allowed to finish. Engine sessions are left to
    /// the caller to stop.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let app = router(self.service);

        tracing::info!("API server listening on http://{}", addr);
        tracing::info!("  POST /api/engine/initialize  - Start an engine session");
        tracing::info!("  POST /api/engine/command     - Send a command, get the next line");
        tracing::info!("  POST /api/engine/cleanup     - Stop a session");
        tracing::info!("  GET  /api/engine/sessions    - List sessions");
        tracing::info!("  POST /api/recognize          - Board image recognition");
        tracing::info!("  GET  /health                 - Health check");

        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("API server error")?;

        tracing::info!("API server stopped");
        Ok(())
    }
}
