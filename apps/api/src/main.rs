mod config;
mod db;
mod errors;
mod extraction;
mod intake;
mod models;
mod pipeline;
mod queue;
mod reconcile;
mod routes;
mod state;
mod store;
mod vlm;

#[cfg(test)]
mod testing;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::pipeline::{JobProcessor, Scheduler, SchedulerConfig};
use crate::queue::PgJobQueue;
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::PgReceiptStore;
use crate::vlm::{OllamaGateway, S3ImageSource};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting receipts API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;
    run_migrations(&db).await?;

    let receipts = Arc::new(PgReceiptStore::new(db.clone()));
    let queue = Arc::new(PgJobQueue::new(db, config.retry.clone()));

    // Initialize S3 / MinIO (receipt images)
    let s3 = build_s3_client(&config).await;
    info!("S3 client initialized");

    // Initialize VLM gateway
    let images = Arc::new(S3ImageSource::new(s3, config.s3_bucket.clone()));
    let gateway = OllamaGateway::new(
        &config.vlm_base_url,
        config.vlm_model.clone(),
        config.vlm_timeout,
        images,
    )?;
    info!(
        "VLM gateway initialized (model: {}, prompt: {})",
        config.vlm_model, config.prompt_version
    );

    // Start the queue monitor
    let processor = Arc::new(JobProcessor::new(
        receipts.clone(),
        queue.clone(),
        Arc::new(gateway),
        config.tolerances.clone(),
        config.prompt_version,
        config.vlm_timeout,
    ));
    let scheduler = Scheduler::new(
        queue.clone(),
        processor,
        SchedulerConfig {
            worker_id: config.worker_id.clone(),
            interval: config.scheduler_interval,
            max_concurrent: config.max_concurrent_jobs,
            stale_after: config.stale_job_after,
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = tokio::spawn(scheduler.run(shutdown_rx));

    // Build app state
    let state = AppState { receipts, queue };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped; waiting for queue monitor");
    let _ = shutdown_tx.send(true);
    monitor.await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
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
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "receipts-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    // MinIO serves buckets by path, not virtual host.
    let s3_config = aws_sdk_s3::config::Builder::from(&s3_config)
        .force_path_style(true)
        .build();

    aws_sdk_s3::Client::from_conf(s3_config)
}
