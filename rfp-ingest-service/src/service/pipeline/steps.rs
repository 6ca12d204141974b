//! Task states: start, office conversion, PDF submission and chunking.

use base64::Engine;
use bytes::Bytes;
use tracing::{info, warn};

use super::execution::StepOutcome;
use crate::chunking::chunk_text;
use crate::db::{ChunkItem, DocumentStatus, Execution, TaskStatus};
use crate::error::{
    DatabaseError, PipelineError, ProcessingError, ServiceError, ServiceResult, StorageError,
    format_error_chain,
};
use crate::ingestion::{FileFormat, detect_format, extract_office_text};
use crate::service::PipelineService;
use crate::workflow::{
    ChunksOutput, PdfOutput, StartOutput, TextOutput, chunk_key, chunks_prefix, text_file_key,
};

/// Opaque correlation handle for a parked execution
fn new_task_token() -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

fn next_state(execution: &Execution) -> ServiceResult<StepOutcome> {
    execution
        .state
        .next()
        .map(StepOutcome::Advance)
        .ok_or_else(|| ServiceError::Internal {
            message: format!("State {} has no successor", execution.state),
        })
}

impl PipelineService {
    /// `StartProcessing`: reset the document to STARTED and record where its
    /// text and chunks will live.
    pub(super) async fn start_processing(
        &self,
        execution: &mut Execution,
    ) -> ServiceResult<StepOutcome> {
        let input = execution.payload.input.clone();
        let mut doc = self.get_document(&input.document_id)?;

        if !doc.status.can_restart() {
            return Err(PipelineError::InvalidTransition {
                from: doc.status.to_string(),
                to: DocumentStatus::Started.to_string(),
            }
            .into());
        }

        if !self.store.exists(&doc.file_key).await? {
            return Err(StorageError::NotFound {
                key: doc.file_key.clone(),
            }
            .into());
        }

        let format = detect_format(&doc.file_key, doc.content_type.as_deref());
        let text_key = text_file_key(&doc.file_key);

        doc.status = DocumentStatus::Started;
        doc.status_reason = None;
        doc.format = (format != FileFormat::Unsupported).then_some(format);
        doc.text_file_key = Some(text_key.clone());
        doc.chunk_count = 0;
        doc.text_detection_job_id = None;
        doc.text_detection_task_token = None;
        self.db.update_document(&doc, &execution.id)?;

        info!(
            execution_id = %execution.id,
            doc_id = %doc.id,
            format = %format,
            "Processing started"
        );

        execution.payload.start = Some(StartOutput {
            format,
            file_key: doc.file_key,
            content_type: doc.content_type,
            text_file_key: text_key,
            chunks_prefix: chunks_prefix(&input),
        });
        next_state(execution)
    }

    /// `ConvertDocx` / `ConvertXlsx`: extract text synchronously
    pub(super) async fn convert_office_document(
        &self,
        execution: &mut Execution,
    ) -> ServiceResult<StepOutcome> {
        let start = execution.payload.start()?.clone();
        let bytes = self.store.get(&start.file_key).await?;

        let format = start.format;
        let text = tokio::task::spawn_blocking(move || extract_office_text(format, &bytes))
            .await
            .map_err(|e| ServiceError::Internal {
                message: format!("Text extraction task panicked: {}", e),
            })??;

        let characters = text.chars().count();
        self.store
            .put(&start.text_file_key, Bytes::from(text))
            .await?;

        let mut doc = self.get_document(&execution.document_id)?;
        doc.transition_to(DocumentStatus::TextExtracted)?;
        doc.text_file_key = Some(start.text_file_key.clone());
        self.db.update_document(&doc, &execution.id)?;

        info!(
            execution_id = %execution.id,
            doc_id = %doc.id,
            format = %format,
            characters,
            "Text extracted"
        );

        execution.payload.text = Some(TextOutput {
            text_file_key: start.text_file_key,
            characters,
        });
        next_state(execution)
    }

    /// `StartPdfTextDetection`: park on a new task token, then submit the
    /// job tagged with the document id. The notification callback resumes
    /// the execution.
    pub(super) async fn submit_pdf_text_detection(
        &self,
        execution: &mut Execution,
    ) -> ServiceResult<StepOutcome> {
        let start = execution.payload.start()?.clone();
        let token = new_task_token();

        let mut doc = self.get_document(&execution.document_id)?;
        doc.text_detection_task_token = Some(token.clone());
        doc.text_detection_job_id = None;
        self.db.park_execution(execution, &token, &doc)?;

        let job_id = match self.detector.start_detection(&start.file_key, &doc.id).await {
            Ok(job_id) => job_id,
            Err(e) => {
                // Hand the execution back to the retry / catch handling
                let cause = format_error_chain(&e);
                if let Err(complete_err) = self.db.complete_task_token(
                    &token,
                    TaskStatus::Failed,
                    None,
                    Some(e.error_code()),
                    Some(&cause),
                ) {
                    warn!(
                        execution_id = %execution.id,
                        error = %complete_err,
                        "Failed to close task token of rejected submission"
                    );
                }
                self.db.clear_text_detection_job(&doc.id, &token)?;
                return Err(e);
            }
        };

        // Already cleared if the callback beat us here
        self.db
            .record_text_detection_job(&doc.id, &token, &job_id)?;
        let pdf = serde_json::to_value(PdfOutput {
            job_id: job_id.clone(),
        })
        .map_err(DatabaseError::Serialization)?;
        self.db.merge_execution_payload(&execution.id, "$.Pdf", &pdf)?;

        info!(
            execution_id = %execution.id,
            doc_id = %doc.id,
            job_id = %job_id,
            "Text detection submitted"
        );

        Ok(StepOutcome::Parked)
    }

    /// `ChunkText`: split the extracted text and store one object per chunk
    pub(super) async fn chunk_document_text(
        &self,
        execution: &mut Execution,
    ) -> ServiceResult<StepOutcome> {
        let text_output = execution.payload.text()?.clone();
        let prefix = execution.payload.start()?.chunks_prefix.clone();

        let bytes = self.store.get(&text_output.text_file_key).await?;
        let text = String::from_utf8_lossy(&bytes);

        let config = self.runtime_config.dynamic().chunking;
        let chunks = chunk_text(&text, &config)?;
        if chunks.is_empty() {
            return Err(ProcessingError::EmptyText {
                document_id: execution.document_id.clone(),
            }
            .into());
        }

        let mut items = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.into_iter().enumerate() {
            let key = chunk_key(&prefix, index);
            self.store.put(&key, Bytes::from(chunk)).await?;
            items.push(ChunkItem {
                chunk_key: key,
                index,
            });
        }

        let mut doc = self.get_document(&execution.document_id)?;
        doc.transition_to(DocumentStatus::Chunked)?;
        doc.chunk_count = items.len();
        self.db
            .record_document_chunks(&doc, &execution.id, &items)?;

        info!(
            execution_id = %execution.id,
            doc_id = %doc.id,
            chunks = items.len(),
            "Text chunked"
        );

        execution.payload.chunks = Some(ChunksOutput {
            count: items.len(),
            items,
        });
        next_state(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_tokens_are_url_safe_and_unique() {
        let a = new_task_token();
        let b = new_task_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }
}
