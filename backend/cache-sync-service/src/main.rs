use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use cache_sync_service::http::{self, AppState};
use cache_sync_service::services::cdc::{ConsumerHealth, KafkaLogClient, LogClient, SyncEngine};
use cache_sync_service::{Config, MemoryStore, MetricsRecorder, StoreAdapter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cache_sync_service=debug".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false).json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting cache-sync-service");

    let config = Config::from_env().context("Failed to load configuration")?;
    let topics = config.topics();
    info!(
        brokers = %config.kafka_brokers,
        group_id = %config.group_id,
        ?topics,
        workers = config.workers,
        partitions = config.partitions,
        "Configuration loaded"
    );

    let metrics = Arc::new(MetricsRecorder::new());
    let store: Arc<dyn StoreAdapter> = Arc::new(MemoryStore::with_partitions(config.partitions));
    let engine = SyncEngine::new(
        config.router().context("Invalid table aliases")?,
        Arc::clone(&store),
        Arc::clone(&metrics),
        config.engine_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for ctrl+c"),
        }
        let _ = shutdown_tx_clone.send(true);
    });

    let kafka_config = config.kafka_config();
    let mut consumers = Vec::with_capacity(config.workers);
    let mut handles = Vec::with_capacity(config.workers);

    for worker in 0..config.workers {
        let client = KafkaLogClient::new(&kafka_config)
            .with_context(|| format!("Failed to create Kafka consumer for worker {}", worker))?;
        client
            .subscribe(&topics)
            .await
            .with_context(|| format!("Failed to subscribe worker {}", worker))?;

        let health = Arc::new(ConsumerHealth::with_backoff(
            worker,
            Duration::from_secs(1),
            config.consumer_max_backoff(),
        ));
        consumers.push(Arc::clone(&health));

        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            engine.run(&client, &health, shutdown).await
        }));
    }

    info!(workers = handles.len(), "Sync workers started");

    let state = AppState {
        metrics: Arc::clone(&metrics),
        store,
        consumers,
    };

    info!("Starting HTTP server on 0.0.0.0:{}", config.http_port);

    let server_result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(http::configure)
    })
    .bind(("0.0.0.0", config.http_port))
    .context("Failed to bind HTTP server")?
    .run()
    .await;

    // The server also stops on ctrl+c; make sure the workers see it too
    let _ = shutdown_tx.send(true);

    info!("Waiting for sync workers to finish their batch");
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(summary) => info!(
                batches = summary.batches,
                events = summary.events,
                rejected = summary.rejected,
                "Sync worker finished"
            ),
            Err(e) => warn!(error = %e, "Sync worker task failed"),
        }
    }

    let snapshot = metrics.snapshot();
    info!(
        processed = snapshot.processed,
        inserted = snapshot.inserted,
        updated = snapshot.updated,
        deleted = snapshot.deleted,
        errored = snapshot.errored,
        "cache-sync-service stopped"
    );

    server_result.context("HTTP server error")
}
