use arc_swap::ArcSwap;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};

/// Environment variable prefix for all configuration sources
pub const ENV_PREFIX: &str = "RFP_INGEST";

// ==================== Static Configuration (startup-only) ====================

/// Static configuration that cannot be changed at runtime
/// These settings affect server binding or require restart to change
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Holds the SQLite database and the `objects/` tree of the object store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

// ==================== Dynamic Configuration (hot-reloadable) ====================

/// Dynamic configuration that can be updated at runtime via API
/// DB values override config file/env defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default = "default_ollama")]
    pub ollama: OllamaConfig,

    #[serde(default = "default_embeddings")]
    pub embeddings: EmbeddingsConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub text_detection: TextDetectionConfig,

    #[serde(default = "default_limits")]
    pub limits: LimitsConfig,
}

/// Ollama connection settings (embedding endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Embeddings configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

/// Character thresholds for splitting extracted text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    #[serde(default = "default_min_chars")]
    pub min_chars: usize,

    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            min_chars: default_min_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

/// Workflow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Wall-clock budget for a whole execution, parked time included
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// Concurrency cap of the indexing fan-out
    #[serde(default = "default_index_max_concurrency")]
    pub index_max_concurrency: usize,

    /// Worker poll interval when no wake-up arrives
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Attempts per task state, the first attempt included
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_retry_backoff_rate")]
    pub retry_backoff_rate: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: default_execution_timeout_secs(),
            index_max_concurrency: default_index_max_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_backoff_rate: default_retry_backoff_rate(),
        }
    }
}

impl PipelineConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Text detection (PDF OCR) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDetectionConfig {
    /// Lines returned per result page
    #[serde(default = "default_text_detection_page_size")]
    pub page_size: usize,
}

impl Default for TextDetectionConfig {
    fn default() -> Self {
        Self {
            page_size: default_text_detection_page_size(),
        }
    }
}

/// Size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_document_size")]
    pub max_document_size_bytes: u64,
}

// ==================== DynamicConfig Settings Keys ====================

/// All valid setting keys for DynamicConfig
pub const VALID_SETTING_KEYS: &[&str] = &[
    "ollama.base_url",
    "ollama.request_timeout_secs",
    "embeddings.model",
    "chunking.max_chars",
    "chunking.min_chars",
    "chunking.overlap_chars",
    "pipeline.execution_timeout_secs",
    "pipeline.index_max_concurrency",
    "pipeline.poll_interval_ms",
    "pipeline.retry_max_attempts",
    "pipeline.retry_interval_ms",
    "pipeline.retry_backoff_rate",
    "text_detection.page_size",
    "limits.max_document_size_bytes",
];

/// Lower bound for `pipeline.poll_interval_ms`
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

impl DynamicConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> ServiceResult<()> {
        let invalid = |message: String| ServiceError::InvalidRequest { message };

        crate::chunking::validate_config(&self.chunking)
            .map_err(|e| invalid(format!("Invalid chunking settings: {}", e)))?;

        if self.pipeline.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(invalid(format!(
                "pipeline.poll_interval_ms must be at least {}",
                MIN_POLL_INTERVAL_MS
            )));
        }
        if self.pipeline.index_max_concurrency == 0 {
            return Err(invalid(
                "pipeline.index_max_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.retry_max_attempts == 0 {
            return Err(invalid(
                "pipeline.retry_max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.text_detection.page_size == 0 {
            return Err(invalid(
                "text_detection.page_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get all valid setting keys
    pub fn valid_keys() -> HashSet<&'static str> {
        VALID_SETTING_KEYS.iter().copied().collect()
    }

    /// Convert config to key-value map for API response
    pub fn to_key_value_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();

        map.insert(
            "ollama.base_url".to_string(),
            serde_json::Value::String(self.ollama.base_url.clone()),
        );
        map.insert(
            "ollama.request_timeout_secs".to_string(),
            serde_json::json!(self.ollama.request_timeout_secs),
        );
        map.insert(
            "embeddings.model".to_string(),
            serde_json::Value::String(self.embeddings.model.clone()),
        );

        // Chunking thresholds
        map.insert(
            "chunking.max_chars".to_string(),
            serde_json::json!(self.chunking.max_chars),
        );
        map.insert(
            "chunking.min_chars".to_string(),
            serde_json::json!(self.chunking.min_chars),
        );
        map.insert(
            "chunking.overlap_chars".to_string(),
            serde_json::json!(self.chunking.overlap_chars),
        );

        // Workflow engine
        map.insert(
            "pipeline.execution_timeout_secs".to_string(),
            serde_json::json!(self.pipeline.execution_timeout_secs),
        );
        map.insert(
            "pipeline.index_max_concurrency".to_string(),
            serde_json::json!(self.pipeline.index_max_concurrency),
        );
        map.insert(
            "pipeline.poll_interval_ms".to_string(),
            serde_json::json!(self.pipeline.poll_interval_ms),
        );
        map.insert(
            "pipeline.retry_max_attempts".to_string(),
            serde_json::json!(self.pipeline.retry_max_attempts),
        );
        map.insert(
            "pipeline.retry_interval_ms".to_string(),
            serde_json::json!(self.pipeline.retry_interval_ms),
        );
        map.insert(
            "pipeline.retry_backoff_rate".to_string(),
            serde_json::json!(self.pipeline.retry_backoff_rate),
        );

        map.insert(
            "text_detection.page_size".to_string(),
            serde_json::json!(self.text_detection.page_size),
        );
        map.insert(
            "limits.max_document_size_bytes".to_string(),
            serde_json::json!(self.limits.max_document_size_bytes),
        );

        map
    }

    /// Apply DB settings as overrides to this config
    pub fn merge_from_db(&mut self, db_settings: &HashMap<String, serde_json::Value>) {
        for (key, value) in db_settings {
            self.apply_setting(key, value);
        }
    }

    /// Apply a single setting value
    fn apply_setting(&mut self, key: &str, value: &serde_json::Value) {
        match key {
            "ollama.base_url" => {
                if let Some(v) = value.as_str() {
                    self.ollama.base_url = v.to_string();
                }
            }
            "ollama.request_timeout_secs" => {
                if let Some(v) = value.as_u64() {
                    self.ollama.request_timeout_secs = v;
                }
            }
            "embeddings.model" => {
                if let Some(v) = value.as_str() {
                    self.embeddings.model = v.to_string();
                }
            }

            "chunking.max_chars" => {
                if let Some(v) = value.as_u64() {
                    self.chunking.max_chars = v as usize;
                }
            }
            "chunking.min_chars" => {
                if let Some(v) = value.as_u64() {
                    self.chunking.min_chars = v as usize;
                }
            }
            "chunking.overlap_chars" => {
                if let Some(v) = value.as_u64() {
                    self.chunking.overlap_chars = v as usize;
                }
            }

            "pipeline.execution_timeout_secs" => {
                if let Some(v) = value.as_u64() {
                    self.pipeline.execution_timeout_secs = v;
                }
            }
            "pipeline.index_max_concurrency" => {
                if let Some(v) = value.as_u64() {
                    self.pipeline.index_max_concurrency = (v as usize).max(1);
                }
            }
            "pipeline.poll_interval_ms" => {
                if let Some(v) = value.as_u64() {
                    self.pipeline.poll_interval_ms = v;
                }
            }
            "pipeline.retry_max_attempts" => {
                if let Some(v) = value.as_u64() {
                    self.pipeline.retry_max_attempts = (v as u32).max(1);
                }
            }
            "pipeline.retry_interval_ms" => {
                if let Some(v) = value.as_u64() {
                    self.pipeline.retry_interval_ms = v;
                }
            }
            "pipeline.retry_backoff_rate" => {
                if let Some(v) = value.as_f64() {
                    self.pipeline.retry_backoff_rate = v;
                }
            }

            "text_detection.page_size" => {
                if let Some(v) = value.as_u64() {
                    self.text_detection.page_size = (v as usize).max(1);
                }
            }
            "limits.max_document_size_bytes" => {
                if let Some(v) = value.as_u64() {
                    self.limits.max_document_size_bytes = v;
                }
            }

            _ => {
                tracing::warn!(key = %key, "Unknown setting key in merge_from_db");
            }
        }
    }
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            ollama: default_ollama(),
            embeddings: default_embeddings(),
            chunking: ChunkingConfig::default(),
            pipeline: PipelineConfig::default(),
            text_detection: TextDetectionConfig::default(),
            limits: default_limits(),
        }
    }
}

// ==================== RuntimeConfig (combines static + dynamic) ====================

/// Runtime configuration manager
/// Combines static config (startup-only) with dynamic config (hot-reloadable via ArcSwap)
pub struct RuntimeConfig {
    /// Static configuration (never changes after startup)
    pub static_config: StaticConfig,
    /// Dynamic configuration (can be hot-reloaded)
    dynamic: ArcSwap<DynamicConfig>,
}

impl RuntimeConfig {
    /// Build from already-loaded parts, without touching files or env
    pub fn new(static_config: StaticConfig, dynamic: DynamicConfig) -> Self {
        Self {
            static_config,
            dynamic: ArcSwap::from_pointee(dynamic),
        }
    }

    /// Get current dynamic config snapshot (lock-free read)
    pub fn dynamic(&self) -> arc_swap::Guard<Arc<DynamicConfig>> {
        self.dynamic.load()
    }

    /// Update dynamic config (atomic swap)
    pub fn update_dynamic(&self, new_config: DynamicConfig) {
        self.dynamic.store(Arc::new(new_config));
    }

    /// Load config from all sources with DB overrides
    pub fn load(static_config: StaticConfig, db: &Database) -> ServiceResult<Self> {
        let mut dynamic = load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);

        Ok(Self::new(static_config, dynamic))
    }

    /// Dynamic config as it would be after applying `updates` on top of the
    /// stored overrides. A null value drops the override.
    pub fn preview_with(
        &self,
        db: &Database,
        updates: &HashMap<String, serde_json::Value>,
    ) -> ServiceResult<DynamicConfig> {
        let mut dynamic = load_dynamic_config()?;
        let mut db_settings = db.get_all_settings()?;
        for (key, value) in updates {
            if value.is_null() {
                db_settings.remove(key);
            } else {
                db_settings.insert(key.clone(), value.clone());
            }
        }
        dynamic.merge_from_db(&db_settings);
        Ok(dynamic)
    }

    /// Rebuild dynamic config from file/env defaults + DB and swap atomically
    pub fn reload_from_db(&self, db: &Database) -> ServiceResult<()> {
        let mut dynamic = load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);
        self.update_dynamic(dynamic);
        Ok(())
    }
}

// ==================== Config Loading Functions ====================

fn builder() -> ServiceResult<Config> {
    Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to build config: {}", e),
        })
}

/// Load static configuration from file and env vars
pub fn load_static_config() -> ServiceResult<StaticConfig> {
    builder()?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize static config: {}", e),
        })
}

/// Load dynamic configuration from file and env vars (without DB overrides)
fn load_dynamic_config() -> ServiceResult<DynamicConfig> {
    builder()?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize dynamic config: {}", e),
        })
}

// ==================== Default Value Functions ====================

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_ollama() -> OllamaConfig {
    OllamaConfig {
        base_url: default_ollama_url(),
        request_timeout_secs: default_request_timeout_secs(),
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_embeddings() -> EmbeddingsConfig {
    EmbeddingsConfig {
        model: default_embedding_model(),
    }
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_max_chars() -> usize {
    2000
}

fn default_min_chars() -> usize {
    500
}

fn default_overlap_chars() -> usize {
    200
}

fn default_execution_timeout_secs() -> u64 {
    30 * 60
}

fn default_index_max_concurrency() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    2000
}

fn default_retry_backoff_rate() -> f64 {
    2.0
}

fn default_text_detection_page_size() -> usize {
    1000
}

fn default_limits() -> LimitsConfig {
    LimitsConfig {
        max_document_size_bytes: default_max_document_size(),
    }
}

fn default_max_document_size() -> u64 {
    104_857_600 // 100MB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_unrunnable_values() {
        assert!(DynamicConfig::default().validate().is_ok());

        let mut config = DynamicConfig::default();
        config.chunking.overlap_chars = config.chunking.max_chars;
        assert!(config.validate().is_err());

        let mut config = DynamicConfig::default();
        config.pipeline.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");

        let mut config = DynamicConfig::default();
        config.pipeline.index_max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_value_map_covers_every_valid_key() {
        let map = DynamicConfig::default().to_key_value_map();
        for key in VALID_SETTING_KEYS {
            assert!(map.contains_key(*key), "missing {key}");
        }
        assert_eq!(map.len(), VALID_SETTING_KEYS.len());
    }

    #[test]
    fn test_merge_from_db_overrides_defaults() {
        let mut config = DynamicConfig::default();
        let mut settings = HashMap::new();
        settings.insert("chunking.max_chars".to_string(), serde_json::json!(800));
        settings.insert(
            "pipeline.index_max_concurrency".to_string(),
            serde_json::json!(0),
        );
        settings.insert(
            "embeddings.model".to_string(),
            serde_json::json!("mxbai-embed-large"),
        );
        settings.insert("unknown.key".to_string(), serde_json::json!(true));

        config.merge_from_db(&settings);

        assert_eq!(config.chunking.max_chars, 800);
        // concurrency is clamped so the fan-out always makes progress
        assert_eq!(config.pipeline.index_max_concurrency, 1);
        assert_eq!(config.embeddings.model, "mxbai-embed-large");
    }

    #[test]
    fn test_default_execution_timeout_is_thirty_minutes() {
        let config = PipelineConfig::default();
        assert_eq!(config.execution_timeout(), Duration::from_secs(1800));
    }
}
