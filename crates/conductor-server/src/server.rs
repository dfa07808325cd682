use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use conductor_core::ids::RequestId;

use crate::bridge;
use crate::orchestrator::{RunRequest, SessionOrchestrator};
use crate::stream::StreamManager;

/// Server configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bound on producing a response. SSE bodies keep streaming past it.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9091,
            request_timeout_secs: 300,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<dyn SessionOrchestrator>,
    pub streams: Arc<StreamManager>,
}

impl AppState {
    pub fn new(orchestrator: Arc<dyn SessionOrchestrator>) -> Self {
        let streams = Arc::clone(orchestrator.streams());
        Self {
            orchestrator,
            streams,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/runs", post(create_run_handler))
        .route("/v1/runs/{request_id}", delete(cancel_run_handler))
        .route("/v1/streams/stats", get(stream_stats_handler))
        .route("/v1/streams/{request_id}/events", get(stream_events_handler))
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, start serving and start stream cleanup. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<dyn SessionOrchestrator>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(orchestrator);
    let streams = Arc::clone(&state.streams);
    streams.start();

    let router = build_router(state, &config);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "conductor server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        streams,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running;
/// call `stop` for an orderly shutdown.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    streams: Arc<StreamManager>,
}

impl ServerHandle {
    /// Stop accepting requests, close live streams, wait for the listener.
    pub async fn stop(self) {
        // Streams go first so open SSE responses end and graceful shutdown can finish.
        self.streams.stop().await;
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
        tracing::info!("conductor server stopped");
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "active_runs": state.orchestrator.active_runs(),
        "stream_sessions": state.streams.session_count(),
    }))
}

/// Runs to completion and returns the outcome. Live progress is available
/// meanwhile on the events route under the same request id.
async fn create_run_handler(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Response {
    match state.orchestrator.run(request).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, e.to_string()),
    }
}

async fn cancel_run_handler(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    let request_id = RequestId::from_raw(request_id);
    if state.orchestrator.cancel(&request_id) {
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "request_id": request_id, "cancelled": true })),
        )
            .into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("no run for request {request_id}"))
    }
}

async fn stream_events_handler(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    let request_id = RequestId::from_raw(request_id);
    let Some(session) = state.streams.get_session_by_request(&request_id) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("no stream for request {request_id}"),
        );
    };
    match bridge::sse_response(session) {
        Ok(sse) => sse.into_response(),
        Err(e) => error_response(
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            e.to_string(),
        ),
    }
}

async fn stream_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "totals": state.streams.stats(),
        "sessions": state.streams.list_sessions(),
    }))
}
