use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: String },

    #[error("{0}")]
    Ollama(#[from] OllamaError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Document processing failed: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Embedding error")]
    Embedding(#[from] EmbeddingError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("Object store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Ollama client errors
#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("Connection failed to Ollama at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Generation failed (status {status}): {message}")]
    Generation { status: u16, message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),

    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

/// Document processing errors
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Failed to extract text from page {page}")]
    TextExtraction {
        page: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unsupported file format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Corrupt {format} document: {message}")]
    CorruptDocument { format: String, message: String },

    #[error("No text could be extracted from document {document_id}")]
    EmptyText { document_id: String },

    #[error("Invalid chunking configuration: {message}")]
    InvalidChunking { message: String },

    #[error("File too large: {size} bytes (max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },
}

/// Embedding errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {message}")]
    ModelInit { message: String },

    #[error("Embedding generation failed: {message}")]
    Generation { message: String },
}

/// Workflow engine errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Document {document_id} already has an execution in flight")]
    ExecutionAlreadyRunning { document_id: String },

    #[error("Invalid task token")]
    InvalidTaskToken,

    #[error("Task already completed with status {status}")]
    TaskAlreadyCompleted { status: String },

    #[error("Task timed out")]
    TaskTimedOut,

    #[error("Execution {execution_id} is not waiting for a task token")]
    ExecutionNotWaiting { execution_id: String },

    #[error("Invalid document status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Document {document_id} was modified concurrently")]
    StaleDocument { document_id: String },

    #[error("Document {document_id} does not belong to organization {org_id} / knowledge base {knowledge_base_id}")]
    DocumentMismatch {
        document_id: String,
        org_id: String,
        knowledge_base_id: String,
    },

    #[error("Execution payload is missing {field}")]
    MissingPayload { field: &'static str },

    #[error("Indexing failed for {failed} of {total} chunks")]
    IndexingFailed { failed: usize, total: usize },

    #[error("Text detection job {job_id} finished with status {status}: {message}")]
    TextDetectionFailed {
        job_id: String,
        status: String,
        message: String,
    },

    #[error("Text detection job not found: {job_id}")]
    TextDetectionJobNotFound { job_id: String },
}

/// Object store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid object key: {key}")]
    InvalidKey { key: String },

    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("IO error on object {key}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::DocumentNotFound { .. } | ServiceError::ExecutionNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Ollama(OllamaError::ModelNotFound { .. }) => StatusCode::NOT_FOUND,
            ServiceError::Processing(ProcessingError::UnsupportedFormat { .. }) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ServiceError::Processing(ProcessingError::FileTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ServiceError::Pipeline(
                PipelineError::ExecutionAlreadyRunning { .. }
                | PipelineError::TaskAlreadyCompleted { .. }
                | PipelineError::ExecutionNotWaiting { .. }
                | PipelineError::StaleDocument { .. }
                | PipelineError::InvalidTransition { .. },
            ) => StatusCode::CONFLICT,
            ServiceError::Pipeline(PipelineError::InvalidTaskToken) => StatusCode::NOT_FOUND,
            ServiceError::Pipeline(PipelineError::TaskTimedOut) => StatusCode::GONE,
            ServiceError::Pipeline(PipelineError::DocumentMismatch { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Storage(StorageError::InvalidKey { .. }) => StatusCode::BAD_REQUEST,
            ServiceError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error name, also used as the execution `error` field
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::ExecutionNotFound { .. } => "execution_not_found",
            ServiceError::Ollama(OllamaError::Connection { .. }) => "ollama_connection",
            ServiceError::Ollama(OllamaError::ModelNotFound { .. }) => "ollama_model_not_found",
            ServiceError::Ollama(OllamaError::Generation { .. }) => "ollama_generation",
            ServiceError::Database(_) => "database_error",
            ServiceError::Processing(ProcessingError::TextExtraction { .. }) => {
                "text_extraction_error"
            }
            ServiceError::Processing(ProcessingError::UnsupportedFormat { .. }) => {
                "unsupported_format"
            }
            ServiceError::Processing(ProcessingError::CorruptDocument { .. }) => {
                "corrupt_document"
            }
            ServiceError::Processing(ProcessingError::EmptyText { .. }) => "empty_text",
            ServiceError::Processing(ProcessingError::InvalidChunking { .. }) => {
                "invalid_chunking"
            }
            ServiceError::Processing(ProcessingError::FileTooLarge { .. }) => "file_too_large",
            ServiceError::Embedding(_) => "embedding_error",
            ServiceError::Pipeline(PipelineError::ExecutionAlreadyRunning { .. }) => {
                "execution_already_running"
            }
            ServiceError::Pipeline(PipelineError::InvalidTaskToken) => "invalid_task_token",
            ServiceError::Pipeline(PipelineError::TaskAlreadyCompleted { .. }) => {
                "task_already_completed"
            }
            ServiceError::Pipeline(PipelineError::TaskTimedOut) => "task_timed_out",
            ServiceError::Pipeline(PipelineError::ExecutionNotWaiting { .. }) => {
                "execution_not_waiting"
            }
            ServiceError::Pipeline(PipelineError::InvalidTransition { .. }) => {
                "invalid_status_transition"
            }
            ServiceError::Pipeline(PipelineError::StaleDocument { .. }) => "stale_document",
            ServiceError::Pipeline(PipelineError::DocumentMismatch { .. }) => "document_mismatch",
            ServiceError::Pipeline(PipelineError::MissingPayload { .. }) => "missing_payload",
            ServiceError::Pipeline(PipelineError::IndexingFailed { .. }) => "indexing_failed",
            ServiceError::Pipeline(PipelineError::TextDetectionFailed { .. }) => {
                "text_detection_failed"
            }
            ServiceError::Pipeline(PipelineError::TextDetectionJobNotFound { .. }) => {
                "text_detection_job_not_found"
            }
            ServiceError::Storage(StorageError::InvalidKey { .. }) => "invalid_object_key",
            ServiceError::Storage(StorageError::NotFound { .. }) => "object_not_found",
            ServiceError::Storage(StorageError::Io { .. }) => "object_store_io",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }

    /// Whether a workflow step failing with this error should be retried.
    ///
    /// Transport and IO failures are transient; bad input never gets better.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Ollama(OllamaError::Connection { .. }) => true,
            ServiceError::Ollama(OllamaError::Generation { status, .. }) => *status >= 500,
            ServiceError::Embedding(EmbeddingError::Generation { .. }) => true,
            ServiceError::Database(DatabaseError::Connection(_) | DatabaseError::Query(_)) => true,
            ServiceError::Storage(StorageError::Io { .. }) => true,
            _ => false,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: format_error_chain(&self),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error and all of its sources as a single line.
pub fn format_error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.ends_with(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_includes_sources() {
        let error = ServiceError::Storage(StorageError::Io {
            key: "a/b.txt".to_string(),
            source: std::io::Error::other("disk full"),
        });
        let chain = format_error_chain(&error);
        assert!(chain.contains("a/b.txt"));
        assert!(chain.ends_with("disk full"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(
            ServiceError::Storage(StorageError::Io {
                key: "k".to_string(),
                source: std::io::Error::other("x"),
            })
            .is_retryable()
        );
        assert!(
            !ServiceError::Processing(ProcessingError::UnsupportedFormat {
                format: "txt".to_string()
            })
            .is_retryable()
        );
        assert!(
            !ServiceError::Ollama(OllamaError::Generation {
                status: 400,
                message: "bad".to_string()
            })
            .is_retryable()
        );
        assert!(
            ServiceError::Ollama(OllamaError::Generation {
                status: 503,
                message: "busy".to_string()
            })
            .is_retryable()
        );
    }

    #[test]
    fn test_conflict_status_for_running_execution() {
        let error = ServiceError::Pipeline(PipelineError::ExecutionAlreadyRunning {
            document_id: "d1".to_string(),
        });
        assert_eq!(error.status_code(), StatusCode::CONFLICT);
        assert_eq!(error.error_code(), "execution_already_running");
    }
}
