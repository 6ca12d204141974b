//! HTTP API for the ingestion service.
//!
//! This module provides the REST API endpoints for:
//! - Health and metrics monitoring
//! - Document upload and lookup
//! - Starting and inspecting pipeline executions
//! - Task token signalling and text detection callbacks
//! - Hot-reloadable settings

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::PipelineService;

pub mod documents;
pub mod executions;
pub mod notifications;
pub mod settings;
pub mod tasks;
use documents::{get_document_chunks_handler, get_document_handler, upload_document_handler};
use executions::{get_execution_handler, get_execution_history_handler, start_execution_handler};
use notifications::text_detection_notification_handler;
use settings::{get_settings_handler, update_settings_handler};
use tasks::{send_task_failure_handler, send_task_success_handler};

/// Application state
pub struct AppState {
    pub service: Arc<PipelineService>,
    /// Renders the installed Prometheus recorder; `None` when no recorder is
    /// installed
    pub metrics: Option<PrometheusHandle>,
}

/// Build the API router
pub fn router(service: Arc<PipelineService>, metrics: Option<PrometheusHandle>) -> Router {
    // Use the configured max document size for uploads
    let max_body_size = service
        .runtime_config
        .dynamic()
        .limits
        .max_document_size_bytes as usize;

    let state = Arc::new(AppState { service, metrics });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Document endpoints - with larger body limit for file uploads
        .route(
            "/documents",
            post(upload_document_handler).layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/documents/{id}", get(get_document_handler))
        .route("/documents/{id}/chunks", get(get_document_chunks_handler))
        // Execution endpoints
        .route("/executions", post(start_execution_handler))
        .route("/executions/{id}", get(get_execution_handler))
        .route("/executions/{id}/history", get(get_execution_history_handler))
        // Task token signalling
        .route("/tasks/success", post(send_task_success_handler))
        .route("/tasks/failure", post(send_task_failure_handler))
        // Detector callbacks
        .route(
            "/text-detection/notifications",
            post(text_detection_notification_handler),
        )
        // Settings endpoints
        .route(
            "/settings",
            get(get_settings_handler).put(update_settings_handler),
        );

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let embedder_available = state.service.embedder.health_check().await;

    let status = if embedder_available {
        "healthy".to_string()
    } else {
        "degraded: embedder unavailable".to_string()
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.service.uptime().as_secs(),
        embedder_available,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    embedder_available: bool,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
