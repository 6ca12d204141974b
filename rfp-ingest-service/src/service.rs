mod documents;
mod pipeline;

pub use pipeline::CallbackOutcome;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::db::Database;
use crate::embedding::Embedder;
use crate::error::ServiceResult;
use crate::storage::ObjectStore;
use crate::text_detection::TextDetector;

/// Main service coordinator
pub struct PipelineService {
    pub runtime_config: Arc<RuntimeConfig>,
    pub db: Arc<Database>,
    pub store: Arc<dyn ObjectStore>,
    pub detector: Arc<dyn TextDetector>,
    pub embedder: Arc<dyn Embedder>,
    /// Wakes the pipeline worker when an execution becomes runnable
    wake: Arc<Notify>,
    started_at: Instant,
}

impl PipelineService {
    pub fn new(
        runtime_config: Arc<RuntimeConfig>,
        db: Arc<Database>,
        store: Arc<dyn ObjectStore>,
        detector: Arc<dyn TextDetector>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        info!("Initializing document pipeline service");

        Self {
            runtime_config,
            db,
            store,
            detector,
            embedder,
            wake: Arc::new(Notify::new()),
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Update settings and hot-reload the dynamic config
    pub async fn update_settings(&self, updates: HashMap<String, serde_json::Value>) -> ServiceResult<()> {
        // Nothing is stored unless the merged result is usable
        self.runtime_config
            .preview_with(&self.db, &updates)?
            .validate()?;

        self.db.set_settings(updates)?;

        // Components read the dynamic config on every use, so a swap is enough
        self.runtime_config.reload_from_db(&self.db)?;

        info!("Settings updated and configuration reloaded");
        Ok(())
    }

    /// Wake the pipeline worker now
    fn wake_worker(&self) {
        self.wake.notify_one();
    }

    /// Wake the pipeline worker once `delay` has passed
    fn wake_worker_after(&self, delay: Duration) {
        if delay.is_zero() {
            self.wake_worker();
            return;
        }
        let wake = self.wake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            wake.notify_one();
        });
    }
}
