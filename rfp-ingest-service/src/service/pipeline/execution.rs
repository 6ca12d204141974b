//! Starting executions and driving them through the state machine.

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, error, info, warn};

use super::{record_execution_finished, record_step_failure, record_task_retry};
use crate::db::{DocumentOutcome, EventType, Execution, ExecutionStatus};
use crate::error::{PipelineError, ServiceError, ServiceResult, format_error_chain};
use crate::service::PipelineService;
use crate::workflow::{
    ExecutionInput, ExecutionPayload, RetryPolicy, StateKind, StateName, choose_file_format,
};

/// Error recorded on executions that outlive their deadline
const TIMEOUT_ERROR: &str = "States.Timeout";

/// Result of running one state
pub(super) enum StepOutcome {
    /// Move on to the given state
    Advance(StateName),
    /// Waiting on a task token; the callback resumes the execution
    Parked,
    /// The execution reached a terminal status
    Finished,
}

impl PipelineService {
    /// Start a new execution for a document.
    ///
    /// Rejected with `ExecutionAlreadyRunning` while another execution of the
    /// same document is in flight.
    pub fn start_execution(&self, input: ExecutionInput) -> ServiceResult<Execution> {
        input.validate()?;

        let doc = self.get_document(&input.document_id)?;
        if doc.org_id != input.org_id || doc.knowledge_base_id != input.knowledge_base_id {
            return Err(PipelineError::DocumentMismatch {
                document_id: input.document_id,
                org_id: input.org_id,
                knowledge_base_id: input.knowledge_base_id,
            }
            .into());
        }

        let timeout_secs = self.runtime_config.dynamic().pipeline.execution_timeout_secs;
        let now = Utc::now();
        let execution = Execution {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: input.org_id.clone(),
            knowledge_base_id: input.knowledge_base_id.clone(),
            document_id: input.document_id.clone(),
            state: StateName::START,
            status: ExecutionStatus::Running,
            payload: ExecutionPayload::new(input),
            error: None,
            cause: None,
            attempt: 1,
            next_attempt_at: now,
            map_total: 0,
            map_completed: 0,
            deadline_at: now + chrono::Duration::seconds(timeout_secs.min(i32::MAX as u64) as i64),
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        self.db.create_execution(&execution)?;
        counter!("pipeline_executions_started_total").increment(1);

        info!(
            execution_id = %execution.id,
            doc_id = %execution.document_id,
            deadline = %execution.deadline_at,
            "Execution started"
        );

        self.wake_worker();
        Ok(execution)
    }

    /// Drive every RUNNING execution whose next attempt is due until it
    /// parks, schedules a retry or finishes. Returns how many were driven.
    pub async fn run_pending_executions(&self) -> ServiceResult<usize> {
        let mut driven = 0;
        while let Some(execution) = self.db.next_runnable_execution(Utc::now())? {
            self.drive_execution(execution).await?;
            driven += 1;
        }
        Ok(driven)
    }

    async fn drive_execution(&self, mut execution: Execution) -> ServiceResult<()> {
        loop {
            if Utc::now() >= execution.deadline_at {
                self.time_out_execution(&execution)?;
                return Ok(());
            }

            let state = execution.state;
            let detail = (execution.attempt > 1)
                .then(|| serde_json::json!({ "attempt": execution.attempt }));
            self.db.append_execution_event(
                &execution.id,
                EventType::StateEntered,
                Some(state.as_ref()),
                detail,
            )?;
            debug!(
                execution_id = %execution.id,
                state = %state,
                attempt = execution.attempt,
                "Entering state"
            );

            let outcome = match self.run_state(&mut execution).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.handle_step_error(&mut execution, e)?;
                    return Ok(());
                }
            };

            match outcome {
                StepOutcome::Advance(next) => {
                    self.db.append_execution_event(
                        &execution.id,
                        EventType::StateExited,
                        Some(state.as_ref()),
                        None,
                    )?;

                    execution.state = next;
                    execution.attempt = 1;
                    execution.next_attempt_at = Utc::now();
                    execution.error = None;
                    execution.cause = None;

                    if !self.db.save_execution(&execution)? {
                        // Finished elsewhere, e.g. by the timeout sweeper
                        debug!(execution_id = %execution.id, "Execution no longer in flight");
                        return Ok(());
                    }
                }
                StepOutcome::Parked => {
                    debug!(execution_id = %execution.id, state = %state, "Execution parked");
                    return Ok(());
                }
                StepOutcome::Finished => return Ok(()),
            }
        }
    }

    async fn run_state(&self, execution: &mut Execution) -> ServiceResult<StepOutcome> {
        let state = execution.state;

        match state.kind() {
            StateKind::Choice => {
                let format = execution.payload.start()?.format;
                Ok(StepOutcome::Advance(choose_file_format(format)))
            }
            StateKind::Succeed => {
                if self.db.finish_execution(
                    &execution.id,
                    ExecutionStatus::Succeeded,
                    None,
                    None,
                    DocumentOutcome::Release,
                )? {
                    record_execution_finished(ExecutionStatus::Succeeded);
                    info!(
                        execution_id = %execution.id,
                        doc_id = %execution.document_id,
                        "Execution succeeded"
                    );
                }
                Ok(StepOutcome::Finished)
            }
            StateKind::Fail => {
                let (error, cause) = state.fail_error().unwrap_or(("States.Fail", ""));
                // A Fail state is not a step failure; the document keeps its status
                if self.db.finish_execution(
                    &execution.id,
                    ExecutionStatus::Failed,
                    Some(error),
                    Some(cause),
                    DocumentOutcome::Release,
                )? {
                    record_execution_finished(ExecutionStatus::Failed);
                    warn!(
                        execution_id = %execution.id,
                        doc_id = %execution.document_id,
                        state = %state,
                        error = %error,
                        "Execution failed"
                    );
                }
                Ok(StepOutcome::Finished)
            }
            StateKind::Task | StateKind::WaitForTaskToken | StateKind::Map => {
                let outcome = match state {
                    StateName::StartProcessing => self.start_processing(execution).await?,
                    StateName::ConvertDocx | StateName::ConvertXlsx => {
                        self.convert_office_document(execution).await?
                    }
                    StateName::ChunkText => self.chunk_document_text(execution).await?,
                    StateName::StartPdfTextDetection => {
                        return self.submit_pdf_text_detection(execution).await;
                    }
                    StateName::IndexChunks => self.index_chunks(execution).await?,
                    other => {
                        return Err(ServiceError::Internal {
                            message: format!("State {} has no task", other),
                        });
                    }
                };
                Ok(outcome)
            }
        }
    }

    /// Retry the state if the policy allows, otherwise catch: fail the
    /// execution and the document.
    fn handle_step_error(&self, execution: &mut Execution, err: ServiceError) -> ServiceResult<()> {
        let state = execution.state;
        let policy = RetryPolicy::from_config(&self.runtime_config.dynamic().pipeline);
        let cause = format_error_chain(&err);

        if policy.should_retry(execution.attempt, &err) {
            let delay = policy.delay_after(execution.attempt);
            warn!(
                execution_id = %execution.id,
                state = %state,
                attempt = execution.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %cause,
                "Step failed, retrying"
            );

            execution.attempt += 1;
            execution.status = ExecutionStatus::Running;
            execution.next_attempt_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            execution.error = Some(err.error_code().to_string());
            execution.cause = Some(cause.clone());

            if self.db.save_execution(execution)? {
                self.db.append_execution_event(
                    &execution.id,
                    EventType::TaskRetryScheduled,
                    Some(state.as_ref()),
                    Some(serde_json::json!({
                        "attempt": execution.attempt,
                        "delayMs": delay.as_millis() as u64,
                        "error": err.error_code(),
                        "cause": cause,
                    })),
                )?;
                record_task_retry(state);
                self.wake_worker_after(delay);
            }
            return Ok(());
        }

        error!(
            execution_id = %execution.id,
            doc_id = %execution.document_id,
            state = %state,
            attempt = execution.attempt,
            error = %cause,
            "Step failed"
        );
        record_step_failure(state);
        self.fail_execution(execution, err.error_code(), &cause)?;
        Ok(())
    }

    /// Finish an in-flight execution as FAILED and mark its document FAILED
    pub(super) fn fail_execution(
        &self,
        execution: &Execution,
        error: &str,
        cause: &str,
    ) -> ServiceResult<bool> {
        let finished = self.db.finish_execution(
            &execution.id,
            ExecutionStatus::Failed,
            Some(error),
            Some(cause),
            DocumentOutcome::Fail(cause.to_string()),
        )?;
        if finished {
            record_execution_finished(ExecutionStatus::Failed);
        }
        Ok(finished)
    }

    fn time_out_execution(&self, execution: &Execution) -> ServiceResult<bool> {
        let cause = format!(
            "Execution exceeded its deadline of {}",
            execution.deadline_at.to_rfc3339()
        );
        let finished = self.db.finish_execution(
            &execution.id,
            ExecutionStatus::TimedOut,
            Some(TIMEOUT_ERROR),
            Some(&cause),
            DocumentOutcome::Fail(cause.clone()),
        )?;

        if finished {
            record_execution_finished(ExecutionStatus::TimedOut);
            warn!(
                execution_id = %execution.id,
                doc_id = %execution.document_id,
                state = %execution.state,
                "Execution timed out"
            );
        }
        Ok(finished)
    }

    /// Time out every in-flight execution whose deadline is at or before
    /// `now`. Pending task tokens of those executions become TIMED_OUT.
    pub fn expire_overdue_executions(&self, now: DateTime<Utc>) -> ServiceResult<usize> {
        let mut expired = 0;
        for execution in self.db.expired_executions(now)? {
            if self.time_out_execution(&execution)? {
                expired += 1;
            }
        }
        Ok(expired)
    }
}
