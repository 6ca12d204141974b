use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{EmbeddingError, OllamaError, ServiceError, ServiceResult};

/// Produces the vector stored for one chunk
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>>;

    /// Model name recorded next to each vector
    fn model(&self) -> String;

    /// Whether the embedding backend answers at all
    async fn health_check(&self) -> bool;
}

/// Embedder backed by Ollama's `/api/embeddings`.
///
/// Base URL and model are read from the dynamic config on every call so a
/// settings update applies to the next chunk.
pub struct OllamaEmbedder {
    client: Client,
    runtime_config: Arc<RuntimeConfig>,
}

impl OllamaEmbedder {
    pub fn new(runtime_config: Arc<RuntimeConfig>) -> ServiceResult<Self> {
        let timeout = runtime_config.dynamic().ollama.request_timeout_secs;
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| {
                ServiceError::Embedding(EmbeddingError::ModelInit {
                    message: e.to_string(),
                })
            })?;

        Ok(Self {
            client,
            runtime_config,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let (url, model) = {
            let config = self.runtime_config.dynamic();
            (
                format!("{}/api/embeddings", config.ollama.base_url),
                config.embeddings.model.clone(),
            )
        };

        let request = OllamaEmbeddingRequest {
            model: model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                ServiceError::Ollama(OllamaError::Connection {
                    url: url.clone(),
                    source: e,
                })
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();

            if message.contains("model")
                && (message.contains("not found") || message.contains("does not exist"))
            {
                return Err(ServiceError::Ollama(OllamaError::ModelNotFound { model }));
            }

            return Err(ServiceError::Ollama(OllamaError::Generation {
                status,
                message,
            }));
        }

        let embedding_response: OllamaEmbeddingResponse = response.json().await.map_err(|e| {
            ServiceError::Embedding(EmbeddingError::Generation {
                message: e.to_string(),
            })
        })?;

        if embedding_response.embedding.is_empty() {
            return Err(ServiceError::Embedding(EmbeddingError::Generation {
                message: format!("model {} returned an empty embedding", model),
            }));
        }

        debug!(
            model = %model,
            dimensions = embedding_response.embedding.len(),
            "Chunk embedded"
        );
        Ok(embedding_response.embedding)
    }

    fn model(&self) -> String {
        self.runtime_config.dynamic().embeddings.model.clone()
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.runtime_config.dynamic().ollama.base_url);

        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Ollama health check failed");
                false
            }
        }
    }
}

/// Ollama embedding request
#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

/// Ollama embedding response
#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}
