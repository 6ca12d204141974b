//! Task token signalling endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::AppState;
use crate::error::ServiceResult;

/// Request body for POST /api/tasks/success
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSuccessRequest {
    pub task_token: String,
    pub output: serde_json::Value,
}

/// Request body for POST /api/tasks/failure
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailureRequest {
    pub task_token: String,
    pub error: String,
    #[serde(default)]
    pub cause: Option<String>,
}

/// POST /api/tasks/success
pub async fn send_task_success_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TaskSuccessRequest>,
) -> ServiceResult<StatusCode> {
    state
        .service
        .send_task_success(&request.task_token, request.output)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/failure
pub async fn send_task_failure_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TaskFailureRequest>,
) -> ServiceResult<StatusCode> {
    state.service.send_task_failure(
        &request.task_token,
        &request.error,
        request.cause.as_deref(),
    )?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::router;
    use crate::api::tests::{json_request, send};
    use crate::db::{DocumentStatus, ExecutionStatus};
    use crate::test_support::TestPipeline;

    #[tokio::test]
    async fn test_task_signalling_over_http() {
        let pipeline = TestPipeline::new();
        let service = &pipeline.service;
        let doc = pipeline.upload("rfp.pdf", b"%PDF-1.7".to_vec()).await;
        let execution = service.start_execution(pipeline.input_for(&doc.id)).unwrap();
        service.run_pending_executions().await.unwrap();

        let token = service
            .get_document(&doc.id)
            .unwrap()
            .text_detection_task_token
            .unwrap();
        let app = router(service.clone(), None);

        let (status, _) = send(
            app.clone(),
            json_request(
                "POST",
                "/api/tasks/failure",
                json!({"taskToken": token, "error": "OcrError", "cause": "bad scan"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(
            service.get_execution(&execution.id).unwrap().status,
            ExecutionStatus::Failed
        );
        assert_eq!(
            service.get_document(&doc.id).unwrap().status,
            DocumentStatus::Failed
        );

        // The token is spent
        let (status, error) = send(
            app.clone(),
            json_request(
                "POST",
                "/api/tasks/success",
                json!({"taskToken": token, "output": {"textFileKey": "a.txt", "characters": 1}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["code"], "task_already_completed");

        let (status, error) = send(
            app,
            json_request(
                "POST",
                "/api/tasks/success",
                json!({"taskToken": "unknown", "output": {}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["code"], "invalid_task_token");
    }
}
