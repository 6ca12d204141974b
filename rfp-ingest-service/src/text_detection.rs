//! Asynchronous PDF text detection.
//!
//! A detector accepts a job, runs it in the background and announces the
//! outcome on a notification topic. Results are then fetched page by page.
//! The local implementation extracts text with PDFium.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::{PipelineError, ServiceError, ServiceResult, format_error_chain};
use crate::ingestion::pdf::{extract_pdf_lines, join_pages};
use crate::storage::ObjectStore;

/// Name of the detection API reported in notifications
pub const DETECTION_API: &str = "StartDocumentTextDetection";

/// Finished jobs are forgotten after this long
const JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Status of a detection job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Succeeded,
    Failed,
    Error,
}

/// One LINE block of a detection result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedLine {
    /// 1-based page number
    pub page: u32,
    pub text: String,
}

/// One page of detection results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDetectionPage {
    pub job_status: JobStatus,
    pub status_message: Option<String>,
    pub lines: Vec<DetectedLine>,
    pub next_token: Option<String>,
}

/// Completion message published on the notification topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TextDetectionNotification {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(rename = "API", default)]
    pub api: Option<String>,
    #[serde(default)]
    pub job_tag: Option<String>,
    /// Epoch milliseconds
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Envelope used when the notification arrives through a pub/sub topic
#[derive(Debug, Deserialize)]
struct TopicEnvelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Message")]
    message: String,
}

impl TextDetectionNotification {
    /// Parse a raw notification or one wrapped in a topic envelope
    pub fn parse(body: &serde_json::Value) -> ServiceResult<Self> {
        let invalid = |e: serde_json::Error| ServiceError::InvalidRequest {
            message: format!("Invalid text detection notification: {}", e),
        };

        if body.get("Type").is_some() && body.get("Message").is_some() {
            let envelope: TopicEnvelope =
                serde_json::from_value(body.clone()).map_err(invalid)?;
            if envelope.kind != "Notification" {
                return Err(ServiceError::InvalidRequest {
                    message: format!("Unsupported envelope type {}", envelope.kind),
                });
            }
            return serde_json::from_str(&envelope.message).map_err(invalid);
        }

        serde_json::from_value(body.clone()).map_err(invalid)
    }
}

/// Group detected lines by page and join them: lines by `\n`, pages by a
/// blank line
pub fn join_detected_lines(lines: &[DetectedLine]) -> String {
    let mut pages: Vec<Vec<String>> = Vec::new();
    let mut current_page = None;
    for line in lines {
        if current_page != Some(line.page) {
            pages.push(Vec::new());
            current_page = Some(line.page);
        }
        if let Some(page) = pages.last_mut() {
            page.push(line.text.clone());
        }
    }
    join_pages(&pages)
}

#[async_trait]
pub trait TextDetector: Send + Sync {
    /// Submit the object at `file_key`. Returns the job id; completion is
    /// announced on the notification topic.
    async fn start_detection(&self, file_key: &str, job_tag: &str) -> ServiceResult<String>;

    /// Fetch one page of results. `next_token` comes from the previous page.
    async fn get_detection_page(
        &self,
        job_id: &str,
        next_token: Option<&str>,
    ) -> ServiceResult<TextDetectionPage>;
}

enum JobState {
    InProgress,
    Succeeded(Arc<Vec<DetectedLine>>),
    Failed(String),
}

struct DetectionJob {
    state: JobState,
    finished_at: Option<Instant>,
}

/// Text detector running PDFium on the blocking pool
pub struct PdfiumTextDetector {
    store: Arc<dyn ObjectStore>,
    runtime_config: Arc<RuntimeConfig>,
    jobs: Arc<DashMap<String, DetectionJob>>,
    topic: mpsc::UnboundedSender<TextDetectionNotification>,
}

impl PdfiumTextDetector {
    /// Create the detector and the receiving end of its notification topic
    pub fn new(
        store: Arc<dyn ObjectStore>,
        runtime_config: Arc<RuntimeConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<TextDetectionNotification>) {
        let (topic, receiver) = mpsc::unbounded_channel();
        let detector = Self {
            store,
            runtime_config,
            jobs: Arc::new(DashMap::new()),
            topic,
        };
        (detector, receiver)
    }

    fn prune_finished_jobs(&self) {
        self.jobs.retain(|_, job| {
            job.finished_at
                .is_none_or(|finished| finished.elapsed() < JOB_RETENTION)
        });
    }

    async fn run_job(
        store: Arc<dyn ObjectStore>,
        file_key: String,
    ) -> Result<Vec<DetectedLine>, String> {
        let bytes = store
            .get(&file_key)
            .await
            .map_err(|e| format_error_chain(&e))?;

        let pages = tokio::task::spawn_blocking(move || extract_pdf_lines(&bytes))
            .await
            .map_err(|e| format!("Text detection task panicked: {}", e))?
            .map_err(|e| format_error_chain(&e))?;

        Ok(pages
            .into_iter()
            .enumerate()
            .flat_map(|(index, lines)| {
                lines.into_iter().map(move |text| DetectedLine {
                    page: index as u32 + 1,
                    text,
                })
            })
            .collect())
    }
}

#[async_trait]
impl TextDetector for PdfiumTextDetector {
    async fn start_detection(&self, file_key: &str, job_tag: &str) -> ServiceResult<String> {
        self.prune_finished_jobs();

        let job_id = uuid::Uuid::new_v4().simple().to_string();
        self.jobs.insert(
            job_id.clone(),
            DetectionJob {
                state: JobState::InProgress,
                finished_at: None,
            },
        );

        let store = self.store.clone();
        let jobs = self.jobs.clone();
        let topic = self.topic.clone();
        let file_key = file_key.to_string();
        let job_tag = job_tag.to_string();
        let spawned_job_id = job_id.clone();

        tokio::spawn(async move {
            let job_id = spawned_job_id;
            let started = Instant::now();
            let (state, status) = match Self::run_job(store, file_key.clone()).await {
                Ok(lines) => {
                    info!(
                        job_id = %job_id,
                        file_key = %file_key,
                        lines = lines.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Text detection succeeded"
                    );
                    (JobState::Succeeded(Arc::new(lines)), JobStatus::Succeeded)
                }
                Err(message) => {
                    warn!(job_id = %job_id, file_key = %file_key, error = %message, "Text detection failed");
                    (JobState::Failed(message), JobStatus::Failed)
                }
            };

            jobs.insert(
                job_id.clone(),
                DetectionJob {
                    state,
                    finished_at: Some(Instant::now()),
                },
            );

            let notification = TextDetectionNotification {
                job_id: job_id.clone(),
                status,
                api: Some(DETECTION_API.to_string()),
                job_tag: Some(job_tag),
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
            };
            if topic.send(notification).is_err() {
                warn!(job_id = %job_id, "Notification topic closed, completion not delivered");
            }
        });

        Ok(job_id)
    }

    async fn get_detection_page(
        &self,
        job_id: &str,
        next_token: Option<&str>,
    ) -> ServiceResult<TextDetectionPage> {
        let (status, message, lines) = {
            let job = self.jobs.get(job_id).ok_or_else(|| {
                ServiceError::Pipeline(PipelineError::TextDetectionJobNotFound {
                    job_id: job_id.to_string(),
                })
            })?;
            match &job.state {
                JobState::InProgress => (JobStatus::InProgress, None, None),
                JobState::Succeeded(lines) => (JobStatus::Succeeded, None, Some(lines.clone())),
                JobState::Failed(message) => (JobStatus::Failed, Some(message.clone()), None),
            }
        };

        let Some(lines) = lines else {
            return Ok(TextDetectionPage {
                job_status: status,
                status_message: message,
                lines: Vec::new(),
                next_token: None,
            });
        };

        let page_size = self.runtime_config.dynamic().text_detection.page_size;
        let (page, next_token) = page_of(&lines, next_token, page_size)?;
        Ok(TextDetectionPage {
            job_status: status,
            status_message: None,
            lines: page,
            next_token,
        })
    }
}

/// Slice one result page. The continuation token is the offset of the next
/// line.
fn page_of(
    lines: &[DetectedLine],
    next_token: Option<&str>,
    page_size: usize,
) -> ServiceResult<(Vec<DetectedLine>, Option<String>)> {
    let offset = match next_token {
        Some(token) => token
            .parse::<usize>()
            .ok()
            .filter(|offset| *offset <= lines.len())
            .ok_or_else(|| ServiceError::InvalidRequest {
                message: format!("Invalid pagination token {}", token),
            })?,
        None => 0,
    };

    let end = offset.saturating_add(page_size.max(1)).min(lines.len());
    let next = (end < lines.len()).then(|| end.to_string());
    Ok((lines[offset..end].to_vec(), next))
}
