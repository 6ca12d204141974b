//! Document pipeline state machine.
//!
//! States, their kinds, the transition table, the retry policy for task
//! states, and the JSON payload threaded through an execution. The engine that
//! drives executions lives in `service::pipeline`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::config::PipelineConfig;
use crate::db::models::ChunkItem;
use crate::error::{PipelineError, ServiceError};
use crate::ingestion::FileFormat;

/// Named states of the document pipeline
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
pub enum StateName {
    StartProcessing,
    ChooseFileFormat,
    StartPdfTextDetection,
    ConvertDocx,
    ConvertXlsx,
    ChunkText,
    IndexChunks,
    UnsupportedFormat,
    Succeeded,
}

/// Behaviour class of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// Runs to completion inside the worker
    Task,
    /// Routes on the payload without side effects
    Choice,
    /// Submits external work and parks until its task token completes
    WaitForTaskToken,
    /// Bounded fan-out over the chunk list
    Map,
    Fail,
    Succeed,
}

impl StateName {
    /// Entry state of every execution
    pub const START: StateName = StateName::StartProcessing;

    pub fn kind(self) -> StateKind {
        match self {
            StateName::StartProcessing
            | StateName::ConvertDocx
            | StateName::ConvertXlsx
            | StateName::ChunkText => StateKind::Task,
            StateName::ChooseFileFormat => StateKind::Choice,
            StateName::StartPdfTextDetection => StateKind::WaitForTaskToken,
            StateName::IndexChunks => StateKind::Map,
            StateName::UnsupportedFormat => StateKind::Fail,
            StateName::Succeeded => StateKind::Succeed,
        }
    }

    /// Static successor. `None` for the Choice state and terminal states.
    pub fn next(self) -> Option<StateName> {
        match self {
            StateName::StartProcessing => Some(StateName::ChooseFileFormat),
            StateName::StartPdfTextDetection | StateName::ConvertDocx | StateName::ConvertXlsx => {
                Some(StateName::ChunkText)
            }
            StateName::ChunkText => Some(StateName::IndexChunks),
            StateName::IndexChunks => Some(StateName::Succeeded),
            StateName::ChooseFileFormat | StateName::UnsupportedFormat | StateName::Succeeded => {
                None
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self.kind(), StateKind::Fail | StateKind::Succeed)
    }

    /// Error name recorded when a Fail state is reached
    pub fn fail_error(self) -> Option<(&'static str, &'static str)> {
        match self {
            StateName::UnsupportedFormat => Some((
                "UnsupportedFormat",
                "Document format is not supported by the pipeline",
            )),
            _ => None,
        }
    }
}

/// `ChooseFileFormat`, keyed on `$.Start.format`
pub fn choose_file_format(format: FileFormat) -> StateName {
    match format {
        FileFormat::Pdf => StateName::StartPdfTextDetection,
        FileFormat::Docx => StateName::ConvertDocx,
        FileFormat::Xlsx => StateName::ConvertXlsx,
        FileFormat::Unsupported => StateName::UnsupportedFormat,
    }
}

// ==================== Retry ====================

/// Retry configuration shared by task states
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub interval: Duration,
    pub backoff_rate: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            interval: Duration::from_millis(config.retry_interval_ms),
            backoff_rate: config.retry_backoff_rate.max(1.0),
        }
    }

    /// Whether a failure on `attempt` (1-based) should be retried
    pub fn should_retry(&self, attempt: u32, error: &ServiceError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Delay before the attempt following `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.interval
            .mul_f64(self.backoff_rate.powi(exponent).min(1_000.0))
    }
}

// ==================== Payload ====================

/// Input event of an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInput {
    pub org_id: String,
    pub document_id: String,
    pub knowledge_base_id: String,
}

impl ExecutionInput {
    pub fn validate(&self) -> Result<(), ServiceError> {
        for (name, value) in [
            ("orgId", &self.org_id),
            ("documentId", &self.document_id),
            ("knowledgeBaseId", &self.knowledge_base_id),
        ] {
            if value.trim().is_empty() {
                return Err(ServiceError::InvalidRequest {
                    message: format!("{} must not be empty", name),
                });
            }
        }
        Ok(())
    }
}

/// Output of `StartProcessing`, stored at `$.Start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutput {
    pub format: FileFormat,
    pub file_key: String,
    pub content_type: Option<String>,
    pub text_file_key: String,
    pub chunks_prefix: String,
}

/// Output of the PDF submission, stored at `$.Pdf`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfOutput {
    pub job_id: String,
}

/// Output of every extraction branch, stored at `$.Text`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOutput {
    pub text_file_key: String,
    pub characters: usize,
}

/// Output of `ChunkText`, stored at `$.Chunks`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunksOutput {
    pub items: Vec<ChunkItem>,
    pub count: usize,
}

/// JSON state threaded through an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    #[serde(rename = "Input")]
    pub input: ExecutionInput,
    #[serde(rename = "Start", default, skip_serializing_if = "Option::is_none")]
    pub start: Option<StartOutput>,
    #[serde(rename = "Pdf", default, skip_serializing_if = "Option::is_none")]
    pub pdf: Option<PdfOutput>,
    #[serde(rename = "Text", default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextOutput>,
    #[serde(rename = "Chunks", default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<ChunksOutput>,
}

impl ExecutionPayload {
    pub fn new(input: ExecutionInput) -> Self {
        Self {
            input,
            start: None,
            pdf: None,
            text: None,
            chunks: None,
        }
    }

    pub fn start(&self) -> Result<&StartOutput, PipelineError> {
        self.start
            .as_ref()
            .ok_or(PipelineError::MissingPayload { field: "Start" })
    }

    pub fn text(&self) -> Result<&TextOutput, PipelineError> {
        self.text
            .as_ref()
            .ok_or(PipelineError::MissingPayload { field: "Text" })
    }

    pub fn chunks(&self) -> Result<&ChunksOutput, PipelineError> {
        self.chunks
            .as_ref()
            .ok_or(PipelineError::MissingPayload { field: "Chunks" })
    }

    /// Merge the output of a completed task token into the result key of the
    /// state that was waiting on it.
    pub fn merge_task_output(
        &mut self,
        state: StateName,
        output: serde_json::Value,
    ) -> Result<(), ServiceError> {
        match state {
            StateName::StartPdfTextDetection => {
                let text: TextOutput =
                    serde_json::from_value(output).map_err(|e| ServiceError::InvalidRequest {
                        message: format!("Task output is not a text result: {}", e),
                    })?;
                self.text = Some(text);
                Ok(())
            }
            other => Err(ServiceError::Internal {
                message: format!("State {} does not wait for a task token", other),
            }),
        }
    }
}

/// Replace the extension of `file_key` with `.txt`
pub fn text_file_key(file_key: &str) -> String {
    let (dir, name) = match file_key.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, file_key),
    };
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    match dir {
        Some(dir) => format!("{}/{}.txt", dir, stem),
        None => format!("{}.txt", stem),
    }
}

/// Object store prefix for the chunks of a document
pub fn chunks_prefix(input: &ExecutionInput) -> String {
    format!(
        "chunks/{}/{}/{}/",
        input.org_id, input.knowledge_base_id, input.document_id
    )
}

/// Object store key of one chunk
pub fn chunk_key(prefix: &str, index: usize) -> String {
    format!("{}{:05}.txt", prefix, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_non_terminal_state_has_a_route() {
        for state in StateName::iter() {
            match state.kind() {
                StateKind::Choice => assert!(state.next().is_none()),
                StateKind::Fail | StateKind::Succeed => assert!(state.is_terminal()),
                _ => assert!(state.next().is_some(), "{state} has no successor"),
            }
        }
    }

    #[test]
    fn test_choose_file_format_routes() {
        assert_eq!(
            choose_file_format(FileFormat::Pdf),
            StateName::StartPdfTextDetection
        );
        assert_eq!(choose_file_format(FileFormat::Docx), StateName::ConvertDocx);
        assert_eq!(choose_file_format(FileFormat::Xlsx), StateName::ConvertXlsx);
        assert_eq!(
            choose_file_format(FileFormat::Unsupported),
            StateName::UnsupportedFormat
        );
    }

    #[test]
    fn test_state_name_round_trips_through_strum() {
        let parsed: StateName = "StartPdfTextDetection".parse().unwrap();
        assert_eq!(parsed, StateName::StartPdfTextDetection);
        assert_eq!(StateName::ChunkText.as_ref(), "ChunkText");
    }

    #[test]
    fn test_retry_delay_backs_off() {
        let policy = RetryPolicy {
            max_attempts: 3,
            interval: Duration::from_millis(100),
            backoff_rate: 2.0,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_only_transient_errors() {
        let policy = RetryPolicy {
            max_attempts: 3,
            interval: Duration::ZERO,
            backoff_rate: 1.0,
        };
        let transient = ServiceError::Embedding(crate::error::EmbeddingError::Generation {
            message: "connection reset".to_string(),
        });
        let permanent = ServiceError::Processing(crate::error::ProcessingError::UnsupportedFormat {
            format: "txt".to_string(),
        });

        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &permanent));
    }

    #[test]
    fn test_derived_keys() {
        assert_eq!(
            text_file_key("documents/o1/kb1/d1/proposal.docx"),
            "documents/o1/kb1/d1/proposal.txt"
        );
        assert_eq!(text_file_key("noext"), "noext.txt");
        assert_eq!(text_file_key("dir/.hidden"), "dir/.hidden.txt");

        let input = ExecutionInput {
            org_id: "o1".to_string(),
            document_id: "d1".to_string(),
            knowledge_base_id: "kb1".to_string(),
        };
        let prefix = chunks_prefix(&input);
        assert_eq!(prefix, "chunks/o1/kb1/d1/");
        assert_eq!(chunk_key(&prefix, 7), "chunks/o1/kb1/d1/00007.txt");
    }

    #[test]
    fn test_payload_uses_result_path_keys() {
        let mut payload = ExecutionPayload::new(ExecutionInput {
            org_id: "o1".to_string(),
            document_id: "d1".to_string(),
            knowledge_base_id: "kb1".to_string(),
        });
        payload
            .merge_task_output(
                StateName::StartPdfTextDetection,
                serde_json::json!({"textFileKey": "a.txt", "characters": 12}),
            )
            .unwrap();

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["Input"]["orgId"], "o1");
        assert_eq!(json["Text"]["characters"], 12);
        assert!(json.get("Start").is_none());
        assert!(payload.start().is_err());
    }
}
