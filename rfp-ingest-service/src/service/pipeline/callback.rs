//! Text detection completion callback.
//!
//! Resolves the document waiting on a job, collects the detected lines,
//! stores them as the document's text and signals the parked execution.
//! Redelivered notifications are acknowledged without side effects.

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use strum::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::db::Document;
use crate::error::{DatabaseError, PipelineError, ServiceError, ServiceResult, format_error_chain};
use crate::service::PipelineService;
use crate::text_detection::{JobStatus, TextDetectionNotification, join_detected_lines};
use crate::workflow::{TextOutput, text_file_key};

/// Error name used when failing a task after unsuccessful text detection
const TEXT_DETECTION_FAILED: &str = "TextDetectionFailed";

/// What a notification did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallbackOutcome {
    /// The waiting task was completed
    Signalled,
    /// The task had already been completed, e.g. a redelivery
    AlreadyHandled,
    /// No document is waiting on this job
    UnknownJob,
    /// Not a completion status
    Ignored,
}

impl PipelineService {
    pub async fn handle_text_detection_notification(
        &self,
        notification: &TextDetectionNotification,
    ) -> ServiceResult<CallbackOutcome> {
        let result = self.process_notification(notification).await;

        let outcome = match &result {
            Ok(outcome) => outcome.to_string(),
            Err(_) => "error".to_string(),
        };
        counter!("pipeline_text_detection_notifications_total", "outcome" => outcome).increment(1);

        result
    }

    async fn process_notification(
        &self,
        notification: &TextDetectionNotification,
    ) -> ServiceResult<CallbackOutcome> {
        let job_id = notification.job_id.as_str();
        if notification.status == JobStatus::InProgress {
            debug!(job_id = %job_id, "Ignoring in-progress notification");
            return Ok(CallbackOutcome::Ignored);
        }

        // The job id is recorded after submission; fall back to the job tag
        // for notifications that arrive before that
        let doc = match self.db.find_document_by_text_detection_job(job_id)? {
            Some(doc) => Some(doc),
            None => match notification.job_tag.as_deref() {
                Some(document_id) => self.db.get_document(document_id)?,
                None => None,
            },
        };

        let Some(doc) = doc else {
            warn!(job_id = %job_id, job_tag = ?notification.job_tag, "Notification for unknown job");
            return Ok(CallbackOutcome::UnknownJob);
        };

        let Some(token) = doc.text_detection_task_token.clone() else {
            debug!(job_id = %job_id, doc_id = %doc.id, "No pending task for notification");
            return Ok(CallbackOutcome::AlreadyHandled);
        };

        if doc
            .text_detection_job_id
            .as_deref()
            .is_some_and(|pending| pending != job_id)
        {
            debug!(
                job_id = %job_id,
                doc_id = %doc.id,
                "Notification for a superseded job"
            );
            return Ok(CallbackOutcome::AlreadyHandled);
        }

        let signal = match notification.status {
            JobStatus::Succeeded => match self.collect_detected_text(job_id, &doc).await {
                Ok(output) => self.send_task_success(&token, output),
                Err(e) => {
                    let cause = format_error_chain(&e);
                    self.send_task_failure(&token, TEXT_DETECTION_FAILED, Some(&cause))
                }
            },
            status => {
                let message = self
                    .detector
                    .get_detection_page(job_id, None)
                    .await
                    .ok()
                    .and_then(|page| page.status_message);
                let cause = match message {
                    Some(message) => message,
                    None => format!("Text detection job {} finished with status {}", job_id, status),
                };
                self.send_task_failure(&token, TEXT_DETECTION_FAILED, Some(&cause))
            }
        };

        match signal {
            Ok(()) => {
                self.db.clear_text_detection_job(&doc.id, &token)?;
                info!(
                    job_id = %job_id,
                    doc_id = %doc.id,
                    status = %notification.status,
                    "Text detection task signalled"
                );
                Ok(CallbackOutcome::Signalled)
            }
            Err(ServiceError::Pipeline(
                PipelineError::TaskAlreadyCompleted { .. }
                | PipelineError::TaskTimedOut
                | PipelineError::InvalidTaskToken,
            )) => {
                self.db.clear_text_detection_job(&doc.id, &token)?;
                debug!(job_id = %job_id, doc_id = %doc.id, "Task already completed");
                Ok(CallbackOutcome::AlreadyHandled)
            }
            Err(e) => Err(e),
        }
    }

    /// Page through the job results and store the joined text. Returns the
    /// task output for the waiting state.
    async fn collect_detected_text(
        &self,
        job_id: &str,
        doc: &Document,
    ) -> ServiceResult<serde_json::Value> {
        let mut lines = Vec::new();
        let mut next_token: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = self
                .detector
                .get_detection_page(job_id, next_token.as_deref())
                .await?;
            pages += 1;

            if page.job_status != JobStatus::Succeeded {
                return Err(PipelineError::TextDetectionFailed {
                    job_id: job_id.to_string(),
                    status: page.job_status.to_string(),
                    message: page.status_message.unwrap_or_default(),
                }
                .into());
            }

            lines.extend(page.lines);
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        let text = join_detected_lines(&lines);
        let characters = text.chars().count();
        let key = doc
            .text_file_key
            .clone()
            .unwrap_or_else(|| text_file_key(&doc.file_key));
        self.store.put(&key, Bytes::from(text)).await?;

        debug!(
            job_id = %job_id,
            doc_id = %doc.id,
            pages,
            lines = lines.len(),
            characters,
            "Detected text stored"
        );

        serde_json::to_value(TextOutput {
            text_file_key: key,
            characters,
        })
        .map_err(|e| DatabaseError::Serialization(e).into())
    }
}
