//! Background workers for the document pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::service::PipelineService;
use crate::text_detection::TextDetectionNotification;

/// How often overdue executions are swept
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

impl PipelineService {
    /// Start the pipeline worker
    /// This should be called once on server startup
    pub fn start_pipeline_worker(service: Arc<PipelineService>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            info!("Pipeline worker started");
            loop {
                let poll_interval = service.runtime_config.dynamic().pipeline.poll_interval();

                let backoff = match service.run_pending_executions().await {
                    Ok(_) => poll_interval,
                    Err(e) => {
                        error!(error = %e, "Failed to drive pending executions");
                        poll_interval * 2
                    }
                };

                // Sleep until woken by a new or resumed execution
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = service.wake.notified() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            info!("Pipeline worker stopped");
        });
    }

    /// Start the worker that times out executions past their deadline
    pub fn start_timeout_sweeper(service: Arc<PipelineService>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            info!("Execution timeout sweeper started");
            loop {
                match service.expire_overdue_executions(Utc::now()) {
                    Ok(0) => {}
                    Ok(expired) => warn!(expired, "Timed out overdue executions"),
                    Err(e) => error!(error = %e, "Failed to sweep overdue executions"),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(TIMEOUT_SWEEP_INTERVAL) => {}
                }
            }
            info!("Execution timeout sweeper stopped");
        });
    }

    /// Deliver notifications published by the text detector
    pub fn start_notification_listener(
        service: Arc<PipelineService>,
        mut notifications: mpsc::UnboundedReceiver<TextDetectionNotification>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            info!("Text detection notification listener started");
            loop {
                let notification = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = notifications.recv() => match received {
                        Some(notification) => notification,
                        None => break,
                    },
                };

                if let Err(e) = service
                    .handle_text_detection_notification(&notification)
                    .await
                {
                    error!(
                        job_id = %notification.job_id,
                        error = %e,
                        "Failed to handle text detection notification"
                    );
                }
            }
            info!("Text detection notification listener stopped");
        });
    }
}
