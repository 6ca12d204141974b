//! Document upload and lookups.

use bytes::Bytes;
use tracing::info;

use crate::db::{ChunkItem, Document, Execution, ExecutionEvent};
use crate::error::{ProcessingError, ServiceError, ServiceResult};
use crate::ingestion::hash::compute_content_hash;
use crate::service::PipelineService;

impl PipelineService {
    /// Store an uploaded file and create its document record.
    ///
    /// The document starts as UPLOADED; processing begins when an execution
    /// is started for it. Uploading the same bytes again into the same
    /// knowledge base returns the existing document.
    pub async fn upload_document(
        &self,
        org_id: &str,
        knowledge_base_id: &str,
        file_name: &str,
        content_type: Option<String>,
        content: Bytes,
    ) -> ServiceResult<Document> {
        // Keep only the final path component of client-supplied names
        let file_name = file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();

        for (name, value) in [
            ("orgId", org_id),
            ("knowledgeBaseId", knowledge_base_id),
            ("fileName", file_name),
        ] {
            if value.is_empty() {
                return Err(ServiceError::InvalidRequest {
                    message: format!("{} must not be empty", name),
                });
            }
        }

        // Check file size
        let max_size = self.runtime_config.dynamic().limits.max_document_size_bytes;
        if content.len() as u64 > max_size {
            return Err(ProcessingError::FileTooLarge {
                size: content.len() as u64,
                max: max_size,
            }
            .into());
        }

        let file_hash = compute_content_hash(&content);
        if let Some(existing_id) =
            self.db
                .get_document_by_hash(org_id, knowledge_base_id, &file_hash)?
            && let Some(existing) = self.db.get_document(&existing_id)?
        {
            info!(
                doc_id = %existing.id,
                file_name = %file_name,
                "Duplicate upload, returning existing document"
            );
            return Ok(existing);
        }

        let doc_id = uuid::Uuid::new_v4().to_string();
        let file_key = format!(
            "documents/{}/{}/{}/{}",
            org_id, knowledge_base_id, doc_id, file_name
        );

        let file_size = content.len() as u64;
        self.store.put(&file_key, content).await?;

        let document = Document::new_upload(
            doc_id,
            org_id.to_string(),
            knowledge_base_id.to_string(),
            file_name.to_string(),
            file_key,
            content_type,
            file_hash,
            file_size,
        );
        self.db.insert_document(&document)?;

        info!(
            doc_id = %document.id,
            org_id = %org_id,
            knowledge_base_id = %knowledge_base_id,
            file_name = %file_name,
            bytes = file_size,
            "Document uploaded"
        );

        Ok(document)
    }

    pub fn get_document(&self, document_id: &str) -> ServiceResult<Document> {
        self.db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })
    }

    /// Chunk items recorded by the last chunking step of a document
    pub fn list_document_chunks(&self, document_id: &str) -> ServiceResult<Vec<ChunkItem>> {
        self.get_document(document_id)?;
        self.db.list_document_chunks(document_id)
    }

    pub fn get_execution(&self, execution_id: &str) -> ServiceResult<Execution> {
        self.db
            .get_execution(execution_id)?
            .ok_or_else(|| ServiceError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    /// Append-only history of an execution
    pub fn get_execution_history(&self, execution_id: &str) -> ServiceResult<Vec<ExecutionEvent>> {
        self.get_execution(execution_id)?;
        self.db.list_execution_events(execution_id)
    }
}
