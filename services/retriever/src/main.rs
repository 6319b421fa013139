use anyhow::{Context, Result};
use chunk_retriever::{
    ArtifactConsumer, Config, KafkaDescriptorQueue, ObjectStore, RetrievalOrchestrator,
    S3ObjectStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Chunk Retriever Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let source: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::new(&config.source)
            .await
            .context("Failed to initialize source object store")?,
    );

    let destination: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::new(&config.destination)
            .await
            .context("Failed to initialize destination object store")?,
    );

    let orchestrator = RetrievalOrchestrator::new(
        source,
        config.source.bucket.clone(),
        destination.clone(),
        config.destination.bucket.clone(),
        config.retrieval.clone(),
    )
    .context("Failed to initialize retrieval orchestrator")?;

    // Create Kafka queue
    let queue = Arc::new(
        KafkaDescriptorQueue::new(&config.kafka).context("Failed to initialize Kafka queue")?,
    );

    let consumer = ArtifactConsumer::new(
        queue,
        orchestrator,
        destination,
        config.destination.bucket.clone(),
    );

    // Spawn consumer task
    let cancel = CancellationToken::new();
    let consumer_cancel = cancel.clone();
    let consumer_handle = tokio::spawn(async move {
        consumer.run(consumer_cancel).await;
    });

    info!("Chunk retriever started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down chunk retriever");

    // Let the artifact in progress finish
    cancel.cancel();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Consumer task failed");
    }

    info!("Chunk retriever stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
