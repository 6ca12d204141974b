//! Settings API endpoints for managing pipeline configuration at runtime.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::AppState;
use crate::config::DynamicConfig;
use crate::error::{ServiceError, ServiceResult};

/// Response for GET /api/settings
#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    /// All current settings (merged: defaults + DB overrides)
    pub settings: HashMap<String, serde_json::Value>,
    /// Which keys have DB overrides (vs using defaults)
    pub overridden: Vec<String>,
}

/// Request body for PUT /api/settings
#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    /// Settings to update (key -> value). Use null to delete/revert to default.
    pub settings: HashMap<String, serde_json::Value>,
}

/// GET /api/settings - retrieve all settings with their current values
pub async fn get_settings_handler(
    State(state): State<Arc<AppState>>,
) -> ServiceResult<Json<SettingsResponse>> {
    let db_settings = state.service.db.get_all_settings()?;

    let config = state.service.runtime_config.dynamic();
    let mut overridden: Vec<String> = db_settings.keys().cloned().collect();
    overridden.sort();

    Ok(Json(SettingsResponse {
        settings: config.to_key_value_map(),
        overridden,
    }))
}

/// PUT /api/settings - update settings (triggers hot reload)
pub async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateSettingsRequest>,
) -> ServiceResult<Json<SettingsResponse>> {
    let valid_keys = DynamicConfig::valid_keys();
    for key in request.settings.keys() {
        if !valid_keys.contains(key.as_str()) {
            return Err(ServiceError::InvalidRequest {
                message: format!("Unknown setting key: {}", key),
            });
        }
    }

    state.service.update_settings(request.settings).await?;

    get_settings_handler(State(state)).await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    use crate::api::router;
    use crate::api::tests::{json_request, send};
    use crate::test_support::TestPipeline;

    #[tokio::test]
    async fn test_update_settings_hot_reloads() {
        let pipeline = TestPipeline::new();
        let app = router(pipeline.service.clone(), None);

        let (status, body) = send(
            app.clone(),
            json_request(
                "PUT",
                "/api/settings",
                json!({"settings": {"pipeline.index_max_concurrency": 7}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["pipeline.index_max_concurrency"], 7);
        assert_eq!(body["overridden"], json!(["pipeline.index_max_concurrency"]));
        assert_eq!(
            pipeline
                .service
                .runtime_config
                .dynamic()
                .pipeline
                .index_max_concurrency,
            7
        );

        let (status, body) = send(
            app,
            Request::builder()
                .uri("/api/settings")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["pipeline.index_max_concurrency"], 7);
    }

    #[tokio::test]
    async fn test_unrunnable_settings_are_rejected_and_not_stored() {
        let pipeline = TestPipeline::new();
        let app = router(pipeline.service.clone(), None);

        let (status, body) = send(
            app.clone(),
            json_request(
                "PUT",
                "/api/settings",
                json!({"settings": {
                    "chunking.overlap_chars": 5000,
                    "pipeline.poll_interval_ms": 0
                }}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_request");
        assert!(body["message"].as_str().unwrap().contains("overlap_chars"));

        let (status, body) = send(
            app.clone(),
            json_request(
                "PUT",
                "/api/settings",
                json!({"settings": {"pipeline.poll_interval_ms": 0}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("poll_interval_ms"));

        assert!(pipeline.service.db.get_all_settings().unwrap().is_empty());
        let live = pipeline.service.runtime_config.dynamic();
        assert!(live.chunking.overlap_chars < live.chunking.max_chars);
        assert!(live.pipeline.poll_interval_ms > 0);

        let (status, body) = send(
            app,
            Request::builder()
                .uri("/api/settings")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["overridden"], json!([]));
    }

    #[tokio::test]
    async fn test_unknown_setting_key_is_rejected() {
        let pipeline = TestPipeline::new();
        let app = router(pipeline.service.clone(), None);

        let (status, body) = send(
            app,
            json_request("PUT", "/api/settings", json!({"settings": {"nope": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("nope"));
    }
}
