//! Text detection completion callbacks.

use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;

use crate::api::AppState;
use crate::error::ServiceResult;
use crate::service::CallbackOutcome;
use crate::text_detection::TextDetectionNotification;

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub outcome: CallbackOutcome,
}

/// POST /api/text-detection/notifications - raw notification or one wrapped
/// in a topic envelope
pub async fn text_detection_notification_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> ServiceResult<Json<NotificationResponse>> {
    let notification = TextDetectionNotification::parse(&body)?;
    let outcome = state
        .service
        .handle_text_detection_notification(&notification)
        .await?;
    Ok(Json(NotificationResponse { outcome }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::router;
    use crate::api::tests::{json_request, send};
    use crate::db::DocumentStatus;
    use crate::test_support::TestPipeline;

    #[tokio::test]
    async fn test_enveloped_notification_resumes_execution() {
        let pipeline = TestPipeline::new();
        let service = &pipeline.service;
        let doc = pipeline.upload("rfp.pdf", b"%PDF-1.7".to_vec()).await;
        service.start_execution(pipeline.input_for(&doc.id)).unwrap();
        service.run_pending_executions().await.unwrap();

        let (job_id, _, _) = pipeline.detector.submitted()[0].clone();
        let notification = pipeline
            .detector
            .succeed(&job_id, &[&["Vendor questionnaire", "Question 1"]]);
        let envelope = json!({
            "Type": "Notification",
            "Message": serde_json::to_string(&notification).unwrap(),
        });
        let app = router(service.clone(), None);

        let (status, body) = send(
            app.clone(),
            json_request("POST", "/api/text-detection/notifications", envelope.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "signalled");
        assert_eq!(
            service.get_document(&doc.id).unwrap().status,
            DocumentStatus::TextExtracted
        );

        let (status, body) = send(
            app.clone(),
            json_request("POST", "/api/text-detection/notifications", envelope),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "already_handled");

        let (status, body) = send(
            app,
            json_request(
                "POST",
                "/api/text-detection/notifications",
                json!({"Type": "SubscriptionConfirmation", "Message": "{}"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_request");
    }
}
