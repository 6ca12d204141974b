use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;
mod chunking;
mod config;
mod db;
mod embedding;
mod error;
mod ingestion;
mod service;
mod storage;
mod text_detection;
mod workflow;

#[cfg(test)]
mod test_support;

use crate::config::{RuntimeConfig, load_static_config};
use crate::db::Database;
use crate::embedding::OllamaEmbedder;
use crate::service::PipelineService;
use crate::storage::FsObjectStore;
use crate::text_detection::PdfiumTextDetector;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!(
        "Starting RFP ingestion service v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Static config first, it says where the database lives
    let static_config = load_static_config()?;

    info!(
        host = %static_config.server.host,
        port = static_config.server.port,
        "Static configuration loaded"
    );

    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to install Prometheus recorder, metrics disabled");
            None
        }
    };

    std::fs::create_dir_all(&static_config.storage.data_dir)?;

    let db_path = static_config.storage.data_dir.join("rfp-ingest.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    let data_dir = static_config.storage.data_dir.clone();
    let runtime_config = Arc::new(RuntimeConfig::load(static_config, &db)?);
    info!("Runtime configuration loaded with DB settings");

    let store = Arc::new(FsObjectStore::new(&data_dir));
    let (detector, notifications) = PdfiumTextDetector::new(store.clone(), runtime_config.clone());
    let embedder = OllamaEmbedder::new(runtime_config.clone())?;

    let service = Arc::new(PipelineService::new(
        runtime_config.clone(),
        db,
        store,
        Arc::new(detector),
        Arc::new(embedder),
    ));

    let shutdown = CancellationToken::new();

    // Resumes any executions left RUNNING by a previous process
    PipelineService::start_pipeline_worker(service.clone(), shutdown.clone());
    PipelineService::start_timeout_sweeper(service.clone(), shutdown.clone());
    PipelineService::start_notification_listener(service.clone(), notifications, shutdown.clone());

    let addr = format!(
        "{}:{}",
        runtime_config.static_config.server.host, runtime_config.static_config.server.port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    let app = api::router(service, metrics_handle);
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rfp_ingest_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
