//! Fixtures and fakes shared by unit tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::{DynamicConfig, RuntimeConfig, StaticConfig};
use crate::db::{Database, Document, Execution, ExecutionStatus};
use crate::embedding::Embedder;
use crate::error::{EmbeddingError, ServiceError, ServiceResult, StorageError};
use crate::service::PipelineService;
use crate::storage::{FsObjectStore, ObjectStore};
use crate::text_detection::{
    DETECTION_API, DetectedLine, JobStatus, TextDetectionNotification, TextDetectionPage,
    TextDetector,
};
use crate::workflow::{ExecutionInput, ExecutionPayload, StateName};

/// Document `id` in org `o1`, knowledge base `kb1`
pub fn sample_document(id: &str) -> Document {
    Document::new_upload(
        id.to_string(),
        "o1".to_string(),
        "kb1".to_string(),
        "proposal.docx".to_string(),
        format!("documents/o1/kb1/{}/proposal.docx", id),
        None,
        "abc123".to_string(),
        42,
    )
}

/// Fresh RUNNING execution at the start state
pub fn sample_execution(execution_id: &str, document_id: &str) -> Execution {
    let now = Utc::now();
    Execution {
        id: execution_id.to_string(),
        org_id: "o1".to_string(),
        knowledge_base_id: "kb1".to_string(),
        document_id: document_id.to_string(),
        state: StateName::START,
        status: ExecutionStatus::Running,
        payload: ExecutionPayload::new(ExecutionInput {
            org_id: "o1".to_string(),
            document_id: document_id.to_string(),
            knowledge_base_id: "kb1".to_string(),
        }),
        error: None,
        cause: None,
        attempt: 1,
        next_attempt_at: now,
        map_total: 0,
        map_completed: 0,
        deadline_at: now + chrono::Duration::seconds(1800),
        created_at: now,
        updated_at: now,
        finished_at: None,
    }
}

/// Config rooted at `data_dir` with instant retries and small chunks
pub fn runtime_config(data_dir: &Path) -> Arc<RuntimeConfig> {
    let static_config: StaticConfig = serde_json::from_value(serde_json::json!({
        "storage": { "data_dir": data_dir }
    }))
    .unwrap();

    let mut dynamic = DynamicConfig::default();
    dynamic.chunking.max_chars = 200;
    dynamic.chunking.min_chars = 50;
    dynamic.chunking.overlap_chars = 20;
    dynamic.pipeline.retry_interval_ms = 0;
    dynamic.pipeline.poll_interval_ms = 10;
    dynamic.pipeline.index_max_concurrency = 3;

    Arc::new(RuntimeConfig::new(static_config, dynamic))
}

/// Deterministic embedder; fails on any text containing the marker
#[derive(Default)]
pub struct FakeEmbedder {
    fail_marker: Option<String>,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker
            && text.contains(marker.as_str())
        {
            return Err(ServiceError::Embedding(EmbeddingError::Generation {
                message: "model overloaded".to_string(),
            }));
        }
        let words = text.split_whitespace().count() as f32;
        Ok(vec![text.chars().count() as f32, words, 1.0])
    }

    fn model(&self) -> String {
        "fake-embed".to_string()
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct FakeJob {
    file_key: String,
    job_tag: String,
    result: Option<Result<Vec<DetectedLine>, String>>,
}

/// Detector whose jobs are finished by the test
#[derive(Default)]
pub struct FakeTextDetector {
    jobs: DashMap<String, FakeJob>,
    next_id: AtomicUsize,
    pub fail_submissions: AtomicBool,
}

/// Lines per result page, small to exercise pagination
const FAKE_PAGE_SIZE: usize = 2;

impl FakeTextDetector {
    /// Submitted jobs as `(job_id, file_key, job_tag)`
    pub fn submitted(&self) -> Vec<(String, String, String)> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .map(|job| {
                (
                    job.key().clone(),
                    job.file_key.clone(),
                    job.job_tag.clone(),
                )
            })
            .collect();
        jobs.sort();
        jobs
    }

    /// Finish a job with one line list per page and return its notification
    pub fn succeed(&self, job_id: &str, pages: &[&[&str]]) -> TextDetectionNotification {
        let lines = pages
            .iter()
            .enumerate()
            .flat_map(|(index, lines)| {
                lines.iter().map(move |text| DetectedLine {
                    page: index as u32 + 1,
                    text: text.to_string(),
                })
            })
            .collect();
        self.finish(job_id, Ok(lines), JobStatus::Succeeded)
    }

    pub fn fail(&self, job_id: &str, message: &str) -> TextDetectionNotification {
        self.finish(job_id, Err(message.to_string()), JobStatus::Failed)
    }

    fn finish(
        &self,
        job_id: &str,
        result: Result<Vec<DetectedLine>, String>,
        status: JobStatus,
    ) -> TextDetectionNotification {
        let mut job = self.jobs.get_mut(job_id).unwrap();
        job.result = Some(result);
        TextDetectionNotification {
            job_id: job_id.to_string(),
            status,
            api: Some(DETECTION_API.to_string()),
            job_tag: Some(job.job_tag.clone()),
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }
}

#[async_trait]
impl TextDetector for FakeTextDetector {
    async fn start_detection(&self, file_key: &str, job_tag: &str) -> ServiceResult<String> {
        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(StorageError::Io {
                key: file_key.to_string(),
                source: std::io::Error::other("detector unavailable"),
            }
            .into());
        }
        let job_id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.jobs.insert(
            job_id.clone(),
            FakeJob {
                file_key: file_key.to_string(),
                job_tag: job_tag.to_string(),
                result: None,
            },
        );
        Ok(job_id)
    }

    async fn get_detection_page(
        &self,
        job_id: &str,
        next_token: Option<&str>,
    ) -> ServiceResult<TextDetectionPage> {
        let job = self.jobs.get(job_id).ok_or_else(|| {
            ServiceError::Pipeline(crate::error::PipelineError::TextDetectionJobNotFound {
                job_id: job_id.to_string(),
            })
        })?;

        Ok(match &job.result {
            None => TextDetectionPage {
                job_status: JobStatus::InProgress,
                status_message: None,
                lines: Vec::new(),
                next_token: None,
            },
            Some(Err(message)) => TextDetectionPage {
                job_status: JobStatus::Failed,
                status_message: Some(message.clone()),
                lines: Vec::new(),
                next_token: None,
            },
            Some(Ok(lines)) => {
                let offset: usize = next_token.map(|t| t.parse().unwrap()).unwrap_or(0);
                let end = (offset + FAKE_PAGE_SIZE).min(lines.len());
                TextDetectionPage {
                    job_status: JobStatus::Succeeded,
                    status_message: None,
                    lines: lines[offset..end].to_vec(),
                    next_token: (end < lines.len()).then(|| end.to_string()),
                }
            }
        })
    }
}

/// Pipeline service over a temp directory, an in-memory database and fakes
pub struct TestPipeline {
    pub service: Arc<PipelineService>,
    pub detector: Arc<FakeTextDetector>,
    pub embedder: Arc<FakeEmbedder>,
    _dir: tempfile::TempDir,
}

impl TestPipeline {
    pub fn new() -> Self {
        Self::with_embedder(FakeEmbedder::default())
    }

    pub fn with_embedder(embedder: FakeEmbedder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = runtime_config(dir.path());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        let detector = Arc::new(FakeTextDetector::default());
        let embedder = Arc::new(embedder);

        let service = Arc::new(PipelineService::new(
            config,
            db,
            store,
            detector.clone(),
            embedder.clone(),
        ));

        Self {
            service,
            detector,
            embedder,
            _dir: dir,
        }
    }

    /// Store `content` as a new document in org `o1`, knowledge base `kb1`
    pub async fn upload(&self, file_name: &str, content: Vec<u8>) -> Document {
        self.service
            .upload_document("o1", "kb1", file_name, None, bytes::Bytes::from(content))
            .await
            .unwrap()
    }

    pub fn input_for(&self, document_id: &str) -> ExecutionInput {
        ExecutionInput {
            org_id: "o1".to_string(),
            document_id: document_id.to_string(),
            knowledge_base_id: "kb1".to_string(),
        }
    }
}
