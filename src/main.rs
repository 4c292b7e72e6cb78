//! Uniquery Binary Entry Point
//!
//! This binary runs the streaming event detection pipeline. Core
//! functionality is provided by the `uniquery` library crate.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uniquery::{
    access::http::{HttpDataModelQuery, HttpEventModelAccess},
    access::ModelCache,
    broker::kafka::{KafkaEventProducer, KafkaRecordConsumer, KafkaTopicAdmin},
    config::AppConfig,
    engine::{EventEngine, LevelStore},
    pipeline::{topics, SubscribePipeline},
};

/// Uniquery - Event Detection and Aggregation Service
#[derive(Parser, Debug)]
#[command(name = "uniquery", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "UNIQUERY_CONFIG"
    )]
    config: String,

    /// Broker bootstrap servers (overrides config file)
    #[arg(long, env = "UNIQUERY_BROKERS")]
    brokers: Option<String>,

    /// Tenant prefix (overrides config file)
    #[arg(long, env = "UNIQUERY_TENANT")]
    tenant: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,uniquery=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Uniquery - Event Detection and Aggregation Service");

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration from file
    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(brokers) = cli.brokers {
        config.broker.brokers = brokers;
    }
    if let Some(tenant) = cli.tenant {
        config.broker.tenant = tenant;
    }
    config.validate()?;

    tracing::info!(
        "Brokers: {}, tenant: {}, group: {}",
        config.broker.brokers,
        config.broker.tenant,
        config.broker.group_id,
    );

    // HTTP ports to the collaborating services
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let model_access = Arc::new(HttpEventModelAccess::new(
        client.clone(),
        config.services.event_model_url.clone(),
    ));
    let data_query = Arc::new(HttpDataModelQuery::new(
        client.clone(),
        config.services.data_query_url.clone(),
    ));

    // Broker ports; the transactional id is unique per process instance
    let persistence_topic = topics::persistence_topic(&config.broker.tenant);
    let instance = uuid::Uuid::new_v4().simple().to_string();
    let transactional_id = format!("{persistence_topic}_{}", &instance[..5]);
    tracing::info!("Transactional id: {}", transactional_id);

    let consumer = Arc::new(KafkaRecordConsumer::new(&config.broker)?);
    let producer = Arc::new(KafkaEventProducer::new(&config.broker, &transactional_id)?);
    let admin = Arc::new(KafkaTopicAdmin::new(&config.broker)?);

    // Detection engine and streaming pipeline
    let engine = Arc::new(EventEngine::new(data_query, Arc::new(LevelStore::new())));
    let cache = Arc::new(ModelCache::new(model_access));
    let pipeline = SubscribePipeline::new(
        consumer,
        producer,
        admin,
        cache,
        engine,
        config.broker.tenant.clone(),
        config.engine.locale(),
        config.engine.worker_pool_size,
        config.engine.topic_refresh_interval,
    );

    tracing::info!("Starting pipeline, press Ctrl+C to shutdown");
    let runner = tokio::spawn(async move { pipeline.run().await });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
        result = runner => {
            match result {
                Ok(Ok(())) => tracing::info!("Pipeline exited"),
                Ok(Err(e)) => tracing::error!("Pipeline failed: {}", e),
                Err(e) => tracing::error!("Pipeline task aborted: {}", e),
            }
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
