//! Document upload and lookup endpoints.

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
};
use bytes::Bytes;
use std::sync::Arc;

use crate::api::AppState;
use crate::db::{ChunkItem, Document};
use crate::error::{ServiceError, ServiceResult};

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ServiceError {
    ServiceError::InvalidRequest {
        message: e.body_text(),
    }
}

/// POST /api/documents - multipart upload with `org_id`,
/// `knowledge_base_id` and `file` fields
pub async fn upload_document_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ServiceResult<(StatusCode, Json<Document>)> {
    let mut file: Option<(Bytes, String, Option<String>)> = None;
    let mut org_id: Option<String> = None;
    let mut knowledge_base_id: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(multipart_error(e)),
        };
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("document").to_string();
                // Keep the essence only, parameters such as charset do not
                // affect routing
                let content_type = field
                    .content_type()
                    .and_then(|ct| ct.parse::<mime::Mime>().ok())
                    .map(|m| m.essence_str().to_string());
                let data = field.bytes().await.map_err(multipart_error)?;
                file = Some((data, file_name, content_type));
            }
            "org_id" => {
                org_id = Some(field.text().await.map_err(multipart_error)?);
            }
            "knowledge_base_id" => {
                knowledge_base_id = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    let missing = |field: &str| ServiceError::InvalidRequest {
        message: format!("Missing multipart field: {}", field),
    };
    let (data, file_name, content_type) = file.ok_or_else(|| missing("file"))?;
    let org_id = org_id.ok_or_else(|| missing("org_id"))?;
    let knowledge_base_id = knowledge_base_id.ok_or_else(|| missing("knowledge_base_id"))?;

    let document = state
        .service
        .upload_document(
            org_id.trim(),
            knowledge_base_id.trim(),
            &file_name,
            content_type,
            data,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(document)))
}

/// GET /api/documents/{id}
pub async fn get_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Document>> {
    Ok(Json(state.service.get_document(&id)?))
}

/// GET /api/documents/{id}/chunks
pub async fn get_document_chunks_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Vec<ChunkItem>>> {
    Ok(Json(state.service.list_document_chunks(&id)?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};

    use crate::api::router;
    use crate::api::tests::send;
    use crate::test_support::TestPipeline;

    const BOUNDARY: &str = "rfp-boundary";

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, content)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/pdf\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/documents")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_get_document() {
        let pipeline = TestPipeline::new();
        let app = router(pipeline.service.clone(), None);

        let body = multipart_body(
            &[("org_id", "o1"), ("knowledge_base_id", "kb1")],
            Some(("rfp.pdf", b"%PDF-1.7")),
        );
        let (status, doc) = send(app.clone(), upload_request(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(doc["status"], "UPLOADED");
        assert_eq!(doc["contentType"], "application/pdf");
        let id = doc["id"].as_str().unwrap().to_string();

        let (status, fetched) = send(
            app.clone(),
            Request::builder()
                .uri(format!("/api/documents/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["fileKey"], format!("documents/o1/kb1/{}/rfp.pdf", id));

        let (status, chunks) = send(
            app,
            Request::builder()
                .uri(format!("/api/documents/{}/chunks", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chunks, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_upload_requires_fields() {
        let pipeline = TestPipeline::new();
        let app = router(pipeline.service.clone(), None);

        let body = multipart_body(&[("org_id", "o1")], Some(("rfp.pdf", b"%PDF")));
        let (status, error) = send(app, upload_request(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["code"], "invalid_request");
        assert!(
            error["message"]
                .as_str()
                .unwrap()
                .contains("knowledge_base_id")
        );
    }

    #[tokio::test]
    async fn test_unknown_document_is_not_found() {
        let pipeline = TestPipeline::new();
        let app = router(pipeline.service.clone(), None);

        let (status, error) = send(
            app,
            Request::builder()
                .uri("/api/documents/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["code"], "document_not_found");
    }
}
