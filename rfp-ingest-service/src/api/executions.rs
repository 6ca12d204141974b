//! Pipeline execution endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::api::AppState;
use crate::db::{Execution, ExecutionEvent};
use crate::error::ServiceResult;
use crate::workflow::ExecutionInput;

/// POST /api/executions - start the pipeline for a document
pub async fn start_execution_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ExecutionInput>,
) -> ServiceResult<(StatusCode, Json<Execution>)> {
    let execution = state.service.start_execution(input)?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

/// GET /api/executions/{id}
pub async fn get_execution_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Execution>> {
    Ok(Json(state.service.get_execution(&id)?))
}

/// GET /api/executions/{id}/history
pub async fn get_execution_history_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Vec<ExecutionEvent>>> {
    Ok(Json(state.service.get_execution_history(&id)?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    use crate::api::router;
    use crate::api::tests::{json_request, send};
    use crate::ingestion::docx::tests::{build_docx, paragraphs};
    use crate::test_support::TestPipeline;

    #[tokio::test]
    async fn test_start_and_inspect_execution() {
        let pipeline = TestPipeline::new();
        let doc = pipeline
            .upload(
                "answers.docx",
                build_docx(&paragraphs(&["Our company has delivered managed services since 2009."])),
            )
            .await;
        let app = router(pipeline.service.clone(), None);

        let input = json!({"orgId": "o1", "documentId": doc.id, "knowledgeBaseId": "kb1"});
        let (status, execution) =
            send(app.clone(), json_request("POST", "/api/executions", input.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(execution["status"], "RUNNING");
        assert_eq!(execution["state"], "StartProcessing");
        assert_eq!(execution["payload"]["Input"], input);
        let id = execution["id"].as_str().unwrap().to_string();

        // Concurrent start for the same document
        let (status, error) =
            send(app.clone(), json_request("POST", "/api/executions", input)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["code"], "execution_already_running");

        pipeline.service.run_pending_executions().await.unwrap();

        let (status, execution) = send(
            app.clone(),
            Request::builder()
                .uri(format!("/api/executions/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(execution["status"], "SUCCEEDED");
        assert_eq!(execution["payload"]["Start"]["format"], "DOCX");

        let (status, history) = send(
            app,
            Request::builder()
                .uri(format!("/api/executions/{}/history", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let events = history.as_array().unwrap();
        assert_eq!(events[0]["eventType"], "ExecutionStarted");
        assert_eq!(events.last().unwrap()["eventType"], "ExecutionSucceeded");
    }

    #[tokio::test]
    async fn test_start_rejects_blank_input() {
        let pipeline = TestPipeline::new();
        let app = router(pipeline.service.clone(), None);

        let (status, error) = send(
            app,
            json_request(
                "POST",
                "/api/executions",
                json!({"orgId": " ", "documentId": "d1", "knowledgeBaseId": "kb1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["code"], "invalid_request");
    }
}
