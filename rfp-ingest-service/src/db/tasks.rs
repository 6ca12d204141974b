//! Task token operations.
//!
//! A token is created when an execution parks on external work and completes
//! at most once: the `status = 'PENDING'` guard on the completing UPDATE makes
//! a second completion a no-op that is reported back to the caller.

use chrono::Utc;
use rusqlite::{OptionalExtension, TransactionBehavior, params};

use super::Database;
use super::documents::write_document;
use super::executions::insert_event;
use super::models::{Document, EventType, Execution, TaskStatus, TaskToken, format_timestamp};
use crate::error::{DatabaseError, PipelineError, ServiceResult};

const TOKEN_COLUMNS: &str =
    "token, execution_id, state, status, output, error, cause, created_at, completed_at";

impl Database {
    /// Park `execution` on a new task token.
    ///
    /// Inserts the PENDING token, stores it on the document (compare-and-swap
    /// on behalf of the execution), and flips the execution to WAITING in a
    /// single transaction. Returns the new document version.
    pub fn park_execution(
        &self,
        execution: &Execution,
        token: &str,
        doc: &Document,
    ) -> ServiceResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;

        let now = format_timestamp(&Utc::now());

        tx.execute(
            &format!(
                "INSERT INTO task_tokens ({}) VALUES (?1, ?2, ?3, 'PENDING', NULL, NULL, NULL, ?4, NULL)",
                TOKEN_COLUMNS
            ),
            params![token, execution.id, execution.state.as_ref(), now],
        )
        .map_err(DatabaseError::Query)?;

        let version = write_document(&tx, doc, &execution.id)?;

        let parked = tx
            .execute(
                "UPDATE executions SET status = 'WAITING', updated_at = ?1 WHERE id = ?2 AND status = 'RUNNING'",
                params![now, execution.id],
            )
            .map_err(DatabaseError::Query)?;

        if parked == 0 {
            return Err(PipelineError::ExecutionNotWaiting {
                execution_id: execution.id.clone(),
            }
            .into());
        }

        insert_event(
            &tx,
            &execution.id,
            EventType::TaskSubmitted,
            Some(execution.state.as_ref()),
            None,
        )?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(version)
    }

    /// Get a task token
    pub fn get_task_token(&self, token: &str) -> ServiceResult<Option<TaskToken>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {} FROM task_tokens WHERE token = ?1", TOKEN_COLUMNS),
            params![token],
            TaskToken::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Complete a PENDING token exactly once.
    ///
    /// Returns `InvalidTaskToken` for unknown tokens, `TaskTimedOut` for
    /// tokens closed by the timeout sweeper and `TaskAlreadyCompleted`
    /// otherwise.
    pub fn complete_task_token(
        &self,
        token: &str,
        status: TaskStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
        cause: Option<&str>,
    ) -> ServiceResult<TaskToken> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;

        let output_json = output
            .map(serde_json::to_string)
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        let rows = tx
            .execute(
                "UPDATE task_tokens SET status = ?1, output = ?2, error = ?3, cause = ?4, completed_at = ?5 \
                 WHERE token = ?6 AND status = 'PENDING'",
                params![
                    status.as_ref(),
                    output_json,
                    error,
                    cause,
                    format_timestamp(&Utc::now()),
                    token
                ],
            )
            .map_err(DatabaseError::Query)?;

        let stored = tx
            .query_row(
                &format!("SELECT {} FROM task_tokens WHERE token = ?1", TOKEN_COLUMNS),
                params![token],
                TaskToken::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some(stored) = stored else {
            return Err(PipelineError::InvalidTaskToken.into());
        };

        if rows == 0 {
            return Err(match stored.status {
                TaskStatus::TimedOut => PipelineError::TaskTimedOut,
                other => PipelineError::TaskAlreadyCompleted {
                    status: other.to_string(),
                },
            }
            .into());
        }

        let event_type = if status == TaskStatus::Succeeded {
            EventType::TaskSucceeded
        } else {
            EventType::TaskFailed
        };
        let detail = match status {
            TaskStatus::Succeeded => output.cloned(),
            _ => Some(serde_json::json!({ "error": error, "cause": cause })),
        };
        insert_event(
            &tx,
            &stored.execution_id,
            event_type,
            Some(stored.state.as_ref()),
            detail,
        )?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DocumentOutcome, ExecutionStatus};
    use crate::error::ServiceError;
    use crate::test_support::{sample_document, sample_execution};
    use crate::workflow::StateName;

    fn parked_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("d1")).unwrap();
        let mut execution = sample_execution("exec-1", "d1");
        db.create_execution(&execution).unwrap();

        execution.state = StateName::StartPdfTextDetection;
        db.save_execution(&execution).unwrap();

        let mut doc = db.get_document("d1").unwrap().unwrap();
        doc.text_detection_task_token = Some("tok-1".to_string());
        db.park_execution(&execution, "tok-1", &doc).unwrap();
        db
    }

    #[test]
    fn test_park_sets_waiting_and_token() {
        let db = parked_db();

        let execution = db.get_execution("exec-1").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Waiting);

        let token = db.get_task_token("tok-1").unwrap().unwrap();
        assert_eq!(token.status, TaskStatus::Pending);
        assert_eq!(token.state, StateName::StartPdfTextDetection);

        let doc = db.get_document("d1").unwrap().unwrap();
        assert_eq!(doc.text_detection_task_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_token_completes_exactly_once() {
        let db = parked_db();
        let output = serde_json::json!({"textFileKey": "a.txt", "characters": 3});

        let completed = db
            .complete_task_token("tok-1", TaskStatus::Succeeded, Some(&output), None, None)
            .unwrap();
        assert_eq!(completed.status, TaskStatus::Succeeded);
        assert_eq!(completed.output, Some(output.clone()));

        let err = db
            .complete_task_token("tok-1", TaskStatus::Succeeded, Some(&output), None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Pipeline(PipelineError::TaskAlreadyCompleted { .. })
        ));

        let err = db
            .complete_task_token("nope", TaskStatus::Failed, None, Some("x"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Pipeline(PipelineError::InvalidTaskToken)
        ));
    }

    #[test]
    fn test_timed_out_token_cannot_complete() {
        let db = parked_db();
        db.finish_execution(
            "exec-1",
            ExecutionStatus::TimedOut,
            Some("States.Timeout"),
            None,
            DocumentOutcome::Fail("timed out".to_string()),
        )
        .unwrap();

        let err = db
            .complete_task_token("tok-1", TaskStatus::Succeeded, None, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Pipeline(PipelineError::TaskTimedOut)
        ));
    }
}
