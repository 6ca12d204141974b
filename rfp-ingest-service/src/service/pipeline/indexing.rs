//! `IndexChunks`: bounded fan-out over the chunk list.
//!
//! Each chunk is embedded and upserted into the vector index independently,
//! with at most `pipeline.index_max_concurrency` items in flight. Items that
//! succeeded in an earlier attempt of the state are not embedded again.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use metrics::counter;
use tracing::{debug, info, warn};

use super::execution::StepOutcome;
use crate::db::{ChunkVector, Execution, MapItem, MapItemStatus};
use crate::error::{PipelineError, ServiceError, ServiceResult, format_error_chain};
use crate::service::PipelineService;
use crate::workflow::RetryPolicy;

impl PipelineService {
    pub(super) async fn index_chunks(&self, execution: &mut Execution) -> ServiceResult<StepOutcome> {
        let chunks = execution.payload.chunks()?.clone();

        self.db.create_map_items(&execution.id, &chunks.items)?;
        self.db.reset_failed_map_items(&execution.id)?;
        let pending: Vec<MapItem> = self
            .db
            .list_map_items(&execution.id)?
            .into_iter()
            .filter(|item| item.status != MapItemStatus::Succeeded)
            .collect();

        let (concurrency, policy) = {
            let config = self.runtime_config.dynamic();
            (
                config.pipeline.index_max_concurrency.max(1),
                RetryPolicy::from_config(&config.pipeline),
            )
        };

        info!(
            execution_id = %execution.id,
            doc_id = %execution.document_id,
            total = chunks.count,
            pending = pending.len(),
            concurrency,
            "Indexing chunks"
        );

        let current: &Execution = execution;
        let failures: Vec<usize> = stream::iter(
            pending
                .into_iter()
                .map(|item| self.index_map_item(current, item, policy)),
        )
        .buffer_unordered(concurrency)
        .filter_map(|failed| async move { failed })
        .collect()
        .await;

        execution.map_total = chunks.count;
        if !failures.is_empty() {
            return Err(PipelineError::IndexingFailed {
                failed: failures.len(),
                total: chunks.count,
            }
            .into());
        }

        // Every item has to be counted before the state can complete
        let stored = self.get_execution(&execution.id)?;
        execution.map_completed = stored.map_completed;
        if stored.map_completed != stored.map_total {
            return Err(PipelineError::IndexingFailed {
                failed: stored.map_total.saturating_sub(stored.map_completed),
                total: stored.map_total,
            }
            .into());
        }

        execution
            .state
            .next()
            .map(StepOutcome::Advance)
            .ok_or_else(|| ServiceError::Internal {
                message: format!("State {} has no successor", execution.state),
            })
    }

    /// Index one item with in-place retries. Returns the item index on
    /// final failure.
    async fn index_map_item(
        &self,
        execution: &Execution,
        item: MapItem,
        policy: RetryPolicy,
    ) -> Option<usize> {
        let mut attempt = 1;
        loop {
            let attempts = item.attempts + attempt;
            let result = match self.embed_chunk(execution, &item).await {
                Ok(()) => self
                    .db
                    .complete_map_item(&execution.id, item.item_index, attempts),
                Err(e) => Err(e),
            };

            match result {
                Ok(progress) => {
                    counter!("pipeline_chunks_indexed_total").increment(1);
                    debug!(
                        execution_id = %execution.id,
                        item = item.item_index,
                        completed = progress.completed,
                        total = progress.total,
                        "Chunk indexed"
                    );
                    if progress.document_indexed {
                        info!(
                            execution_id = %execution.id,
                            doc_id = %execution.document_id,
                            chunks = progress.total,
                            "Document indexed"
                        );
                    }
                    return None;
                }
                Err(e) if policy.should_retry(attempt, &e) => {
                    let delay = policy.delay_after(attempt);
                    debug!(
                        execution_id = %execution.id,
                        item = item.item_index,
                        attempt,
                        error = %e,
                        "Chunk indexing failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let message = format_error_chain(&e);
                    warn!(
                        execution_id = %execution.id,
                        item = item.item_index,
                        attempts,
                        error = %message,
                        "Chunk indexing failed"
                    );
                    if let Err(db_err) =
                        self.db
                            .fail_map_item(&execution.id, item.item_index, attempts, &message)
                    {
                        warn!(error = %db_err, "Failed to record chunk failure");
                    }
                    counter!("pipeline_chunk_failures_total").increment(1);
                    return Some(item.item_index);
                }
            }
        }
    }

    async fn embed_chunk(&self, execution: &Execution, item: &MapItem) -> ServiceResult<()> {
        let bytes = self.store.get(&item.chunk_key).await?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let embedding = self.embedder.embed(&content).await?;

        self.db.upsert_chunk_vector(&ChunkVector {
            document_id: execution.document_id.clone(),
            chunk_index: item.item_index,
            org_id: execution.org_id.clone(),
            knowledge_base_id: execution.knowledge_base_id.clone(),
            chunk_key: item.chunk_key.clone(),
            content,
            embedding,
            model: self.embedder.model(),
            updated_at: Utc::now(),
        })
    }
}
