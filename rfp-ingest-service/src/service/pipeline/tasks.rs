//! Task token signalling.
//!
//! A parked execution resumes when its token is completed with a success
//! output, and fails through the catch path when it is completed with an
//! error. Each token completes at most once.

use chrono::Utc;
use tracing::{info, warn};

use super::record_step_failure;
use crate::db::{DocumentStatus, EventType, ExecutionStatus, TaskStatus, TaskToken};
use crate::error::{PipelineError, ServiceError, ServiceResult, format_error_chain};
use crate::service::PipelineService;

impl PipelineService {
    /// Token that can still be completed
    fn pending_task(&self, token: &str) -> ServiceResult<TaskToken> {
        let task = self
            .db
            .get_task_token(token)?
            .ok_or(PipelineError::InvalidTaskToken)?;

        match task.status {
            TaskStatus::Pending => Ok(task),
            TaskStatus::TimedOut => Err(PipelineError::TaskTimedOut.into()),
            other => Err(PipelineError::TaskAlreadyCompleted {
                status: other.to_string(),
            }
            .into()),
        }
    }

    /// Complete a task token with `output` and resume its execution at the
    /// successor of the waiting state.
    ///
    /// The output is checked against the waiting state before the token is
    /// consumed, so a malformed output can be corrected and resent.
    pub fn send_task_success(&self, token: &str, output: serde_json::Value) -> ServiceResult<()> {
        let task = self.pending_task(token)?;
        let mut execution = self.get_execution(&task.execution_id)?;
        if execution.status != ExecutionStatus::Waiting || execution.state != task.state {
            return Err(PipelineError::ExecutionNotWaiting {
                execution_id: execution.id,
            }
            .into());
        }

        execution
            .payload
            .merge_task_output(task.state, output.clone())?;
        let next = task.state.next().ok_or_else(|| ServiceError::Internal {
            message: format!("State {} has no successor", task.state),
        })?;

        self.db
            .complete_task_token(token, TaskStatus::Succeeded, Some(&output), None, None)?;

        // The waiting state extracts text; record it on the document
        let text = execution.payload.text()?.clone();
        let document_update = self.get_document(&execution.document_id).and_then(|mut doc| {
            doc.transition_to(DocumentStatus::TextExtracted)?;
            doc.text_file_key = Some(text.text_file_key.clone());
            doc.text_detection_job_id = None;
            doc.text_detection_task_token = None;
            self.db.update_document(&doc, &execution.id)
        });
        if let Err(e) = document_update {
            let cause = format_error_chain(&e);
            warn!(
                execution_id = %execution.id,
                error = %cause,
                "Failed to record extracted text, failing execution"
            );
            record_step_failure(task.state);
            self.fail_execution(&execution, e.error_code(), &cause)?;
            return Err(e);
        }

        self.db.append_execution_event(
            &execution.id,
            EventType::StateExited,
            Some(task.state.as_ref()),
            None,
        )?;

        execution.state = next;
        execution.status = ExecutionStatus::Running;
        execution.attempt = 1;
        execution.next_attempt_at = Utc::now();
        execution.error = None;
        execution.cause = None;
        if !self.db.save_execution(&execution)? {
            warn!(execution_id = %execution.id, "Execution finished before it could resume");
            return Ok(());
        }

        info!(
            execution_id = %execution.id,
            doc_id = %execution.document_id,
            characters = text.characters,
            next_state = %next,
            "Task succeeded, execution resumed"
        );

        self.wake_worker();
        Ok(())
    }

    /// Complete a task token with an error. The execution fails and its
    /// document is marked FAILED without waiting for the deadline.
    pub fn send_task_failure(
        &self,
        token: &str,
        error: &str,
        cause: Option<&str>,
    ) -> ServiceResult<()> {
        let error = error.trim();
        if error.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "error must not be empty".to_string(),
            });
        }

        let task = self.pending_task(token)?;
        self.db
            .complete_task_token(token, TaskStatus::Failed, None, Some(error), cause)?;

        let execution = self.get_execution(&task.execution_id)?;
        record_step_failure(task.state);
        self.fail_execution(&execution, error, cause.unwrap_or(error))?;

        warn!(
            execution_id = %execution.id,
            doc_id = %execution.document_id,
            state = %task.state,
            error = %error,
            cause = cause.unwrap_or_default(),
            "Task failed"
        );
        Ok(())
    }
}
