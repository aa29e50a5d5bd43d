/// HTTP control surface
///
/// `/start`, `/check` and `/stop` drive a single detector session; `/stats`
/// and `/health` report on it. Every route answers JSON and allows
/// cross-origin requests from any origin.

use crate::capture::SourceOpener;
use crate::config::{DetectorConfig, ServerConfig};
use crate::detector::{ClapDetector, DetectorError, DetectorStats};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("Detector task failed: {0}")]
    Task(#[from] JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Detector(DetectorError::DeviceUnavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        error!("Request failed: {}", self);

        let body = ErrorResponse {
            status: "error",
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

impl StatusResponse {
    fn new(status: &'static str) -> Json<Self> {
        Json(Self { status })
    }
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub clap_detected: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// The detector session owned by the server
///
/// Holds at most one detector; its lifecycle is absent -> running -> absent.
/// A detector whose capture ended stays until `/stop` or the next `/start`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Session>,
}

struct Session {
    config: DetectorConfig,
    opener: Arc<dyn SourceOpener>,
    detector: Mutex<Option<ClapDetector>>,
}

impl AppState {
    pub fn new(config: DetectorConfig, opener: Arc<dyn SourceOpener>) -> Self {
        Self {
            inner: Arc::new(Session {
                config,
                opener,
                detector: Mutex::new(None),
            }),
        }
    }

    /// Whether a detector currently exists
    pub async fn is_active(&self) -> bool {
        self.inner.detector.lock().await.is_some()
    }

    /// Stop and discard the detector, if any
    ///
    /// Returns whether there was one. The session is empty afterwards even if
    /// teardown failed.
    pub async fn shutdown(&self) -> bool {
        let mut session = self.inner.detector.lock().await;

        let Some(mut detector) = session.take() else {
            return false;
        };

        if let Err(e) = tokio::task::spawn_blocking(move || detector.stop()).await {
            error!("Detector teardown failed: {}", e);
        }
        true
    }
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/start", get(start_detection))
        .route("/check", get(check_clap))
        .route("/stop", get(stop_detection))
        .route("/stats", get(detector_stats))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn start_detection(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let mut session = state.inner.detector.lock().await;

    if session.as_ref().is_some_and(ClapDetector::is_running) {
        info!("Start requested while detector is running");
        return Ok(StatusResponse::new("already_running"));
    }

    // A detector whose loop ended on its own is replaced
    let finished = session.take();
    if finished.is_some() {
        info!("Replacing detector whose capture ended");
    }

    let config = state.inner.config.clone();
    let opener = state.inner.opener.clone();
    let detector = tokio::task::spawn_blocking(move || {
        drop(finished);
        let mut detector = ClapDetector::new(config, opener)?;
        detector.start()?;
        Ok::<_, DetectorError>(detector)
    })
    .await??;

    *session = Some(detector);
    Ok(StatusResponse::new("started"))
}

async fn check_clap(State(state): State<AppState>) -> Json<CheckResponse> {
    let session = state.inner.detector.lock().await;
    let clap_detected = session
        .as_ref()
        .map(ClapDetector::consume_double_clap)
        .unwrap_or(false);

    Json(CheckResponse { clap_detected })
}

async fn stop_detection(State(state): State<AppState>) -> Json<StatusResponse> {
    if state.shutdown().await {
        StatusResponse::new("stopped")
    } else {
        StatusResponse::new("not_running")
    }
}

async fn detector_stats(State(state): State<AppState>) -> Json<DetectorStats> {
    let session = state.inner.detector.lock().await;
    let stats = session
        .as_ref()
        .map(ClapDetector::stats)
        .unwrap_or_default();

    Json(stats)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::VERSION,
    })
}

/// Serve the control API until Ctrl+C, then stop any running detector
pub async fn serve(config: ServerConfig, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if state.shutdown().await {
        info!("Stopped running detector on shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
