//! Docflow server binary
//!
//! Run with: cargo run -p docflow --bin docflow-server
//! Set `DOCFLOW_CONFIG=/path/to/docflow.toml` to override defaults.

use docflow::{config::PipelineConfig, processing::Pipeline, server::DocflowServer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docflow=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = PipelineConfig::load()?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Backend: {:?}", config.backend);
    if config.backend == docflow::config::StorageBackend::Sqlite {
        tracing::info!("  - Database: {}", config.storage.database_path.display());
    }
    tracing::info!("  - Workers per stage: {}", config.processing.workers_per_stage);
    tracing::info!("  - Reclaim idle: {}ms", config.broker.reclaim_idle_ms);

    let grace = config.processing.shutdown_grace();
    let pipeline = Pipeline::from_config(config)?;
    let workers = pipeline.start().await?;

    let server = DocflowServer::new(&pipeline);
    let state = server.state().clone();

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received");
                    stop.cancel();
                }
                // Keep serving; the process can still be stopped externally
                Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
    });

    println!("\nServer starting...");
    println!("  API: http://{}", server.address());
    println!("  Health: http://{}/health", server.address());
    println!("\nPress Ctrl+C to stop\n");

    let result = server
        .start({
            let stop = stop.clone();
            async move { stop.cancelled().await }
        })
        .await;

    state.set_ready(false);
    stop.cancel();
    let stats = workers.shutdown(grace).await;
    tracing::info!(
        "Drained workers: {} handled, {} malformed, {} retries",
        stats.handled,
        stats.malformed,
        stats.retries
    );

    result?;
    Ok(())
}
