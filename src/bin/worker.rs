use certify_hub::{
    config::AppConfig,
    db,
    services::{
        certification::CERTIFICATION_QUEUE,
        progress::ProgressGateway,
        provider::HttpProviderAdapter,
        queue::{QueueOptions, QueueService},
        worker::CertificationWorker,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const PROMOTER_INTERVAL_MS: u64 = 1000;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting certification worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let queue = QueueService::new(&config.redis_url).expect("Failed to initialize job queue");
    queue.register(
        CERTIFICATION_QUEUE,
        QueueOptions {
            concurrency: config.worker_concurrency,
            attempts: config.job_attempts,
            backoff_delay_ms: config.backoff_delay_ms,
        },
    );

    let provider = Arc::new(HttpProviderAdapter::new(
        &config.provider_base_url,
        &config.provider_api_token,
    ));
    let progress = Arc::new(
        ProgressGateway::new(&config.redis_url).expect("Failed to initialize progress relay"),
    );

    let worker = Arc::new(CertificationWorker::new(
        db_pool,
        provider,
        progress,
        Duration::from_secs(config.certification_timeout_secs),
        config.job_attempts,
    ));

    // Promote delayed retries back to waiting and export queue depth.
    let promoter_queue = queue.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(PROMOTER_INTERVAL_MS));
        loop {
            ticker.tick().await;
            match promoter_queue.promote_due_jobs(CERTIFICATION_QUEUE).await {
                Ok(promoted) if promoted > 0 => {
                    tracing::debug!(promoted, "promoted delayed jobs");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "failed to promote delayed jobs");
                }
            }
            if let Ok(counts) = promoter_queue.queue_counts(CERTIFICATION_QUEUE).await {
                metrics::gauge!("certification_queue_depth").set(counts.waiting as f64);
            }
        }
    });

    tracing::info!(
        concurrency = config.worker_concurrency,
        attempts = config.job_attempts,
        timeout_secs = config.certification_timeout_secs,
        "Worker ready, starting job processing loop"
    );

    // Main processing loop: bounded concurrency and retry/backoff are
    // handled inside the queue service.
    let handler_worker = worker.clone();
    queue
        .run(CERTIFICATION_QUEUE, move |job| {
            let worker = handler_worker.clone();
            async move { worker.handle(job).await }
        })
        .await
        .expect("Worker loop terminated");
}
