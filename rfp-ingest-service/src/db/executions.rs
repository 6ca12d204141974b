//! Workflow execution operations and execution history.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::models::{
    DocumentStatus, EventType, Execution, ExecutionEvent, ExecutionStatus, TaskStatus,
    format_timestamp,
};
use super::{Database, is_constraint_violation};
use crate::error::{DatabaseError, PipelineError, ServiceError, ServiceResult};

/// Document side effect of a terminal execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// Release the active slot, leave the status as is
    Release,
    /// Mark FAILED with the given reason and release the slot
    Fail(String),
}

impl Database {
    /// Insert a new RUNNING execution and claim the document for it.
    ///
    /// Fails with `ExecutionAlreadyRunning` when the document already has an
    /// in-flight execution.
    pub fn create_execution(&self, execution: &Execution) -> ServiceResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;

        let now = format_timestamp(&Utc::now());
        let claimed = tx
            .execute(
                "UPDATE documents SET active_execution_id = ?1, version = version + 1, updated_at = ?2 \
                 WHERE id = ?3 AND active_execution_id IS NULL",
                params![execution.id, now, execution.document_id],
            )
            .map_err(DatabaseError::Query)?;

        if claimed == 0 {
            return Err(PipelineError::ExecutionAlreadyRunning {
                document_id: execution.document_id.clone(),
            }
            .into());
        }

        let payload =
            serde_json::to_string(&execution.payload).map_err(DatabaseError::Serialization)?;

        tx.execute(
            r#"
            INSERT INTO executions (id, org_id, knowledge_base_id, document_id, state, status, payload, error, cause, attempt, next_attempt_at, map_total, map_completed, deadline_at, created_at, updated_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                execution.id,
                execution.org_id,
                execution.knowledge_base_id,
                execution.document_id,
                execution.state.as_ref(),
                execution.status.as_ref(),
                payload,
                execution.error,
                execution.cause,
                execution.attempt as i64,
                format_timestamp(&execution.next_attempt_at),
                execution.map_total as i64,
                execution.map_completed as i64,
                format_timestamp(&execution.deadline_at),
                format_timestamp(&execution.created_at),
                format_timestamp(&execution.updated_at),
                execution.finished_at.as_ref().map(format_timestamp),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                ServiceError::from(PipelineError::ExecutionAlreadyRunning {
                    document_id: execution.document_id.clone(),
                })
            } else {
                ServiceError::from(DatabaseError::Query(e))
            }
        })?;

        insert_event(
            &tx,
            &execution.id,
            EventType::ExecutionStarted,
            None,
            Some(
                serde_json::to_value(&execution.payload.input)
                    .map_err(DatabaseError::Serialization)?,
            ),
        )?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// Get an execution by ID
    pub fn get_execution(&self, id: &str) -> ServiceResult<Option<Execution>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {} FROM executions WHERE id = ?1", Execution::COLUMNS),
            params![id],
            Execution::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Oldest RUNNING execution whose next attempt is due
    pub fn next_runnable_execution(&self, now: DateTime<Utc>) -> ServiceResult<Option<Execution>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!(
                "SELECT {} FROM executions WHERE status = 'RUNNING' AND next_attempt_at <= ?1 \
                 ORDER BY next_attempt_at, created_at LIMIT 1",
                Execution::COLUMNS
            ),
            params![format_timestamp(&now)],
            Execution::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// In-flight executions whose deadline has passed
    pub fn expired_executions(&self, now: DateTime<Utc>) -> ServiceResult<Vec<Execution>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM executions WHERE status IN ('RUNNING', 'WAITING') AND deadline_at <= ?1 \
                 ORDER BY deadline_at",
                Execution::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![format_timestamp(&now)], Execution::from_row)
            .map_err(DatabaseError::Query)?;

        let mut executions = Vec::new();
        for row in rows {
            executions.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(executions)
    }

    /// Persist state, status, payload and retry bookkeeping of an in-flight
    /// execution. Returns false if the execution is no longer in flight.
    pub fn save_execution(&self, execution: &Execution) -> ServiceResult<bool> {
        let conn = self.conn()?;

        let payload =
            serde_json::to_string(&execution.payload).map_err(DatabaseError::Serialization)?;

        let rows = conn
            .execute(
                r#"
                UPDATE executions SET
                    state = ?1, status = ?2, payload = ?3, error = ?4, cause = ?5,
                    attempt = ?6, next_attempt_at = ?7, map_total = ?8, updated_at = ?9
                WHERE id = ?10 AND status IN ('RUNNING', 'WAITING')
                "#,
                params![
                    execution.state.as_ref(),
                    execution.status.as_ref(),
                    payload,
                    execution.error,
                    execution.cause,
                    execution.attempt as i64,
                    format_timestamp(&execution.next_attempt_at),
                    execution.map_total as i64,
                    format_timestamp(&Utc::now()),
                    execution.id,
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Merge a value into the stored payload under `path` without rewriting
    /// the rest of it.
    pub fn merge_execution_payload(
        &self,
        execution_id: &str,
        path: &str,
        value: &serde_json::Value,
    ) -> ServiceResult<bool> {
        let conn = self.conn()?;

        let value = serde_json::to_string(value).map_err(DatabaseError::Serialization)?;
        let rows = conn
            .execute(
                "UPDATE executions SET payload = json_set(payload, ?1, json(?2)), updated_at = ?3 WHERE id = ?4",
                params![path, value, format_timestamp(&Utc::now()), execution_id],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Move an in-flight execution to a terminal status.
    ///
    /// Pending task tokens are closed, the document is released (and
    /// optionally failed), and the closing history event is appended, all in
    /// one transaction. Returns false if the execution had already finished.
    pub fn finish_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
        cause: Option<&str>,
        document: DocumentOutcome,
    ) -> ServiceResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;

        let now = format_timestamp(&Utc::now());

        let document_id: Option<String> = tx
            .query_row(
                "SELECT document_id FROM executions WHERE id = ?1 AND status IN ('RUNNING', 'WAITING')",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some(document_id) = document_id else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE executions SET status = ?1, error = ?2, cause = ?3, finished_at = ?4, updated_at = ?4 WHERE id = ?5",
            params![status.as_ref(), error, cause, now, execution_id],
        )
        .map_err(DatabaseError::Query)?;

        let token_status = if status == ExecutionStatus::TimedOut {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };
        tx.execute(
            "UPDATE task_tokens SET status = ?1, completed_at = ?2 WHERE execution_id = ?3 AND status = 'PENDING'",
            params![token_status.as_ref(), now, execution_id],
        )
        .map_err(DatabaseError::Query)?;

        match &document {
            DocumentOutcome::Release => {
                tx.execute(
                    "UPDATE documents SET active_execution_id = NULL, text_detection_job_id = NULL, \
                     text_detection_task_token = NULL, version = version + 1, updated_at = ?1 \
                     WHERE id = ?2 AND active_execution_id = ?3",
                    params![now, document_id, execution_id],
                )
                .map_err(DatabaseError::Query)?;
            }
            DocumentOutcome::Fail(reason) => {
                tx.execute(
                    "UPDATE documents SET status = ?1, status_reason = ?2, active_execution_id = NULL, \
                     text_detection_job_id = NULL, text_detection_task_token = NULL, \
                     version = version + 1, updated_at = ?3 \
                     WHERE id = ?4 AND active_execution_id = ?5 AND status != 'INDEXED'",
                    params![
                        DocumentStatus::Failed.as_str(),
                        reason,
                        now,
                        document_id,
                        execution_id
                    ],
                )
                .map_err(DatabaseError::Query)?;
                // An INDEXED document only needs its slot back
                tx.execute(
                    "UPDATE documents SET active_execution_id = NULL, version = version + 1, updated_at = ?1 \
                     WHERE id = ?2 AND active_execution_id = ?3",
                    params![now, document_id, execution_id],
                )
                .map_err(DatabaseError::Query)?;
            }
        }

        let event_type = match status {
            ExecutionStatus::Succeeded => EventType::ExecutionSucceeded,
            ExecutionStatus::TimedOut => EventType::ExecutionTimedOut,
            _ => EventType::ExecutionFailed,
        };
        let detail = match (error, cause) {
            (None, None) => None,
            _ => Some(serde_json::json!({ "error": error, "cause": cause })),
        };
        insert_event(&tx, execution_id, event_type, None, detail)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(true)
    }

    /// Append a history event
    pub fn append_execution_event(
        &self,
        execution_id: &str,
        event_type: EventType,
        state: Option<&str>,
        detail: Option<serde_json::Value>,
    ) -> ServiceResult<()> {
        let conn = self.conn()?;
        insert_event(&conn, execution_id, event_type, state, detail)
    }

    /// History of an execution in append order
    pub fn list_execution_events(&self, execution_id: &str) -> ServiceResult<Vec<ExecutionEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, execution_id, event_type, state, detail, timestamp \
                 FROM execution_events WHERE execution_id = ?1 ORDER BY id",
            )
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![execution_id], ExecutionEvent::from_row)
            .map_err(DatabaseError::Query)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(events)
    }
}

pub(super) fn insert_event(
    conn: &Connection,
    execution_id: &str,
    event_type: EventType,
    state: Option<&str>,
    detail: Option<serde_json::Value>,
) -> ServiceResult<()> {
    let detail = detail
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(DatabaseError::Serialization)?;

    conn.execute(
        "INSERT INTO execution_events (execution_id, event_type, state, detail, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            execution_id,
            event_type.as_ref(),
            state,
            detail,
            format_timestamp(&Utc::now())
        ],
    )
    .map_err(DatabaseError::Query)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_document, sample_execution};

    #[test]
    fn test_second_in_flight_execution_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("d1")).unwrap();

        db.create_execution(&sample_execution("exec-1", "d1")).unwrap();
        let err = db
            .create_execution(&sample_execution("exec-2", "d1"))
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Pipeline(PipelineError::ExecutionAlreadyRunning { .. })
        ));

        let doc = db.get_document("d1").unwrap().unwrap();
        assert_eq!(doc.active_execution_id.as_deref(), Some("exec-1"));
        assert!(db.get_execution("exec-2").unwrap().is_none());
    }

    #[test]
    fn test_finish_releases_document_once() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("d1")).unwrap();
        db.create_execution(&sample_execution("exec-1", "d1")).unwrap();

        let finished = db
            .finish_execution(
                "exec-1",
                ExecutionStatus::Failed,
                Some("CorruptDocument"),
                Some("bad zip"),
                DocumentOutcome::Fail("bad zip".to_string()),
            )
            .unwrap();
        assert!(finished);

        let doc = db.get_document("d1").unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.status_reason.as_deref(), Some("bad zip"));
        assert!(doc.active_execution_id.is_none());

        // Already terminal
        assert!(
            !db.finish_execution(
                "exec-1",
                ExecutionStatus::TimedOut,
                None,
                None,
                DocumentOutcome::Release
            )
            .unwrap()
        );

        let events: Vec<EventType> = db
            .list_execution_events("exec-1")
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            events,
            vec![EventType::ExecutionStarted, EventType::ExecutionFailed]
        );

        // Slot is free for a new run
        db.create_execution(&sample_execution("exec-2", "d1")).unwrap();
    }

    #[test]
    fn test_runnable_and_expired_queries() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("d1")).unwrap();
        let mut execution = sample_execution("exec-1", "d1");
        execution.next_attempt_at = Utc::now() + chrono::Duration::seconds(60);
        db.create_execution(&execution).unwrap();

        assert!(db.next_runnable_execution(Utc::now()).unwrap().is_none());
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(
            db.next_runnable_execution(later).unwrap().map(|e| e.id),
            Some("exec-1".to_string())
        );

        assert!(db.expired_executions(Utc::now()).unwrap().is_empty());
        let past_deadline = execution.deadline_at + chrono::Duration::seconds(1);
        assert_eq!(db.expired_executions(past_deadline).unwrap().len(), 1);
    }

    #[test]
    fn test_payload_merge_keeps_other_keys() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&sample_document("d1")).unwrap();
        db.create_execution(&sample_execution("exec-1", "d1")).unwrap();

        db.merge_execution_payload("exec-1", "$.Pdf", &serde_json::json!({"jobId": "job-9"}))
            .unwrap();

        let execution = db.get_execution("exec-1").unwrap().unwrap();
        assert_eq!(execution.payload.pdf.map(|p| p.job_id).as_deref(), Some("job-9"));
        assert_eq!(execution.payload.input.document_id, "d1");
    }
}
