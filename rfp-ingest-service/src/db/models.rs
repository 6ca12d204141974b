//! Database model structs.
//!
//! This module contains the data structures for database records.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::PipelineError;
use crate::ingestion::FileFormat;
use crate::workflow::{ExecutionPayload, StateName};

/// Fixed-width UTC timestamp so stored values compare lexicographically
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_column<T: std::str::FromStr>(idx: usize, value: &str) -> Result<T, rusqlite::Error>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Pipeline status of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    /// Stored, no execution has touched it yet
    Uploaded,
    Started,
    TextExtracted,
    Chunked,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "UPLOADED",
            DocumentStatus::Started => "STARTED",
            DocumentStatus::TextExtracted => "TEXT_EXTRACTED",
            DocumentStatus::Chunked => "CHUNKED",
            DocumentStatus::Indexed => "INDEXED",
            DocumentStatus::Failed => "FAILED",
        }
    }

    fn rank(self) -> u8 {
        match self {
            DocumentStatus::Uploaded => 0,
            DocumentStatus::Started => 1,
            DocumentStatus::TextExtracted => 2,
            DocumentStatus::Chunked => 3,
            DocumentStatus::Indexed => 4,
            DocumentStatus::Failed => 5,
        }
    }

    /// Statuses a new execution may reset to STARTED. STARTED itself is
    /// included because an unsupported format leaves the document there.
    pub fn can_restart(self) -> bool {
        matches!(
            self,
            DocumentStatus::Uploaded
                | DocumentStatus::Started
                | DocumentStatus::Indexed
                | DocumentStatus::Failed
        )
    }

    /// Transition rule inside one execution: forward only, FAILED from any
    /// non-terminal status.
    pub fn can_advance_to(self, next: DocumentStatus) -> bool {
        match (self, next) {
            (DocumentStatus::Indexed | DocumentStatus::Failed, _) => false,
            (_, DocumentStatus::Failed) => true,
            (_, DocumentStatus::Uploaded) => false,
            (current, next) => next.rank() >= current.rank(),
        }
    }
}

/// Document record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub org_id: String,
    pub knowledge_base_id: String,
    pub file_name: String,
    pub file_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FileFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_file_key: Option<String>,
    pub chunk_count: usize,
    pub status: DocumentStatus,
    /// Failure message when status is FAILED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_execution_id: Option<String>,
    /// Optimistic lock counter, bumped on every pipeline write
    pub version: i64,
    /// Pending text detection job, cleared after the callback signals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_detection_job_id: Option<String>,
    #[serde(skip)]
    pub text_detection_task_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub(crate) const COLUMNS: &'static str = "id, org_id, knowledge_base_id, file_name, file_key, content_type, file_hash, file_size, format, text_file_key, chunk_count, status, status_reason, active_execution_id, version, text_detection_job_id, text_detection_task_token, created_at, updated_at";

    /// New record for a freshly stored upload
    #[allow(clippy::too_many_arguments)]
    pub fn new_upload(
        id: String,
        org_id: String,
        knowledge_base_id: String,
        file_name: String,
        file_key: String,
        content_type: Option<String>,
        file_hash: String,
        file_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            org_id,
            knowledge_base_id,
            file_name,
            file_key,
            content_type,
            file_hash: Some(file_hash),
            file_size,
            format: None,
            text_file_key: None,
            chunk_count: 0,
            status: DocumentStatus::Uploaded,
            status_reason: None,
            active_execution_id: None,
            version: 0,
            text_detection_job_id: None,
            text_detection_task_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next` if the status rules allow it
    pub fn transition_to(&mut self, next: DocumentStatus) -> Result<(), PipelineError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_advance_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let file_size: i64 = row.get(7)?;
        let format_str: Option<String> = row.get(8)?;
        let chunk_count: i64 = row.get(10)?;
        let status_str: String = row.get(11)?;
        let created_at_str: String = row.get(17)?;
        let updated_at_str: String = row.get(18)?;

        Ok(Self {
            id: row.get(0)?,
            org_id: row.get(1)?,
            knowledge_base_id: row.get(2)?,
            file_name: row.get(3)?,
            file_key: row.get(4)?,
            content_type: row.get(5)?,
            file_hash: row.get(6)?,
            file_size: file_size as u64,
            format: format_str.as_deref().map(FileFormat::from_str),
            text_file_key: row.get(9)?,
            chunk_count: chunk_count as usize,
            status: parse_column(11, &status_str)?,
            status_reason: row.get(12)?,
            active_execution_id: row.get(13)?,
            version: row.get(14)?,
            text_detection_job_id: row.get(15)?,
            text_detection_task_token: row.get(16)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// One chunk of extracted text in the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkItem {
    pub chunk_key: String,
    pub index: usize,
}

// ==================== Executions ====================

/// Lifecycle status of a workflow execution
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Runnable by a worker once `next_attempt_at` has passed
    Running,
    /// Parked on a task token
    Waiting,
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }
}

/// One workflow run for a document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub org_id: String,
    pub knowledge_base_id: String,
    pub document_id: String,
    pub state: StateName,
    pub status: ExecutionStatus,
    pub payload: ExecutionPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Attempt number of the current state, 1-based
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub map_total: usize,
    pub map_completed: usize,
    pub deadline_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub(crate) const COLUMNS: &'static str = "id, org_id, knowledge_base_id, document_id, state, status, payload, error, cause, attempt, next_attempt_at, map_total, map_completed, deadline_at, created_at, updated_at, finished_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let state_str: String = row.get(4)?;
        let status_str: String = row.get(5)?;
        let payload_str: String = row.get(6)?;
        let attempt: i64 = row.get(9)?;
        let next_attempt_at_str: String = row.get(10)?;
        let map_total: i64 = row.get(11)?;
        let map_completed: i64 = row.get(12)?;
        let deadline_at_str: String = row.get(13)?;
        let created_at_str: String = row.get(14)?;
        let updated_at_str: String = row.get(15)?;
        let finished_at_str: Option<String> = row.get(16)?;

        let payload = serde_json::from_str(&payload_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

        Ok(Self {
            id: row.get(0)?,
            org_id: row.get(1)?,
            knowledge_base_id: row.get(2)?,
            document_id: row.get(3)?,
            state: parse_column(4, &state_str)?,
            status: parse_column(5, &status_str)?,
            payload,
            error: row.get(7)?,
            cause: row.get(8)?,
            attempt: attempt as u32,
            next_attempt_at: parse_timestamp(&next_attempt_at_str),
            map_total: map_total as usize,
            map_completed: map_completed as usize,
            deadline_at: parse_timestamp(&deadline_at_str),
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
            finished_at: finished_at_str.as_deref().map(parse_timestamp),
        })
    }
}

/// Kinds of execution history events
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum EventType {
    ExecutionStarted,
    StateEntered,
    StateExited,
    TaskRetryScheduled,
    TaskFailed,
    TaskSubmitted,
    TaskSucceeded,
    ExecutionSucceeded,
    ExecutionFailed,
    ExecutionTimedOut,
}

/// Entry of the append-only execution history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub id: i64,
    pub execution_id: String,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let event_type_str: String = row.get(2)?;
        let detail_str: Option<String> = row.get(4)?;
        let timestamp_str: String = row.get(5)?;

        Ok(Self {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            event_type: parse_column(2, &event_type_str)?,
            state: row.get(3)?,
            detail: detail_str.and_then(|s| serde_json::from_str(&s).ok()),
            timestamp: parse_timestamp(&timestamp_str),
        })
    }
}

// ==================== Task tokens ====================

/// Completion status of a task token
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

/// Correlation handle for a parked execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskToken {
    pub token: String,
    pub execution_id: String,
    pub state: StateName,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskToken {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let state_str: String = row.get(2)?;
        let status_str: String = row.get(3)?;
        let output_str: Option<String> = row.get(4)?;
        let created_at_str: String = row.get(7)?;
        let completed_at_str: Option<String> = row.get(8)?;

        Ok(Self {
            token: row.get(0)?,
            execution_id: row.get(1)?,
            state: parse_column(2, &state_str)?,
            status: parse_column(3, &status_str)?,
            output: output_str.and_then(|s| serde_json::from_str(&s).ok()),
            error: row.get(5)?,
            cause: row.get(6)?,
            created_at: parse_timestamp(&created_at_str),
            completed_at: completed_at_str.as_deref().map(parse_timestamp),
        })
    }
}

// ==================== Map items ====================

/// Indexing state of one chunk inside the Map state
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MapItemStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapItem {
    pub execution_id: String,
    pub item_index: usize,
    pub chunk_key: String,
    pub status: MapItemStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MapItem {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let item_index: i64 = row.get(1)?;
        let status_str: String = row.get(3)?;
        let attempts: i64 = row.get(4)?;

        Ok(Self {
            execution_id: row.get(0)?,
            item_index: item_index as usize,
            chunk_key: row.get(2)?,
            status: parse_column(3, &status_str)?,
            attempts: attempts as u32,
            error: row.get(5)?,
        })
    }
}

// ==================== Vector index ====================

/// Vector index row, keyed by document and chunk index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkVector {
    pub document_id: String,
    pub chunk_index: usize,
    pub org_id: String,
    pub knowledge_base_id: String,
    pub chunk_key: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub model: String,
    pub updated_at: DateTime<Utc>,
}

impl ChunkVector {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let chunk_index: i64 = row.get(1)?;
        let embedding_bytes: Vec<u8> = row.get(6)?;
        let updated_at_str: String = row.get(8)?;

        // Stored as little-endian f32s
        let embedding = embedding_bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Self {
            document_id: row.get(0)?,
            chunk_index: chunk_index as usize,
            org_id: row.get(2)?,
            knowledge_base_id: row.get(3)?,
            chunk_key: row.get(4)?,
            content: row.get(5)?,
            embedding,
            model: row.get(7)?,
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        use DocumentStatus::*;

        assert!(Started.can_advance_to(TextExtracted));
        assert!(TextExtracted.can_advance_to(Chunked));
        assert!(Chunked.can_advance_to(Indexed));
        assert!(Chunked.can_advance_to(Failed));
        assert!(!Chunked.can_advance_to(Started));
        assert!(!Indexed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Indexed));
    }

    #[test]
    fn test_restartable_statuses() {
        assert!(DocumentStatus::Uploaded.can_restart());
        // Left here by an unsupported-format run
        assert!(DocumentStatus::Started.can_restart());
        assert!(DocumentStatus::Failed.can_restart());
        assert!(DocumentStatus::Indexed.can_restart());
        assert!(!DocumentStatus::Chunked.can_restart());
        assert!(!DocumentStatus::TextExtracted.can_restart());
    }

    #[test]
    fn test_status_strings_match_storage_format() {
        assert_eq!(DocumentStatus::TextExtracted.as_str(), "TEXT_EXTRACTED");
        assert_eq!(
            "TEXT_EXTRACTED".parse::<DocumentStatus>().unwrap(),
            DocumentStatus::TextExtracted
        );
        assert_eq!(ExecutionStatus::TimedOut.as_ref(), "TIMED_OUT");
        assert_eq!(
            serde_json::to_value(TaskStatus::Pending).unwrap(),
            serde_json::json!("PENDING")
        );
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = early + chrono::Duration::milliseconds(1500);
        assert!(format_timestamp(&early) < format_timestamp(&later));
        assert_eq!(parse_timestamp(&format_timestamp(&later)), later);
    }
}
