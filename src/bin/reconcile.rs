use certify_hub::{
    config::AppConfig,
    db,
    services::{
        certification::CERTIFICATION_QUEUE,
        queue::{QueueOptions, QueueService},
        reconcile,
    },
};
use tracing_subscriber::EnvFilter;

/// One-shot reconciliation audit between the queue backend and the durable
/// store. Prints a JSON report to stdout; exits non-zero when critical
/// desyncs are present so it can gate alerts in cron.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    let queue = QueueService::new(&config.redis_url).expect("Failed to initialize job queue");
    queue.register(
        CERTIFICATION_QUEUE,
        QueueOptions {
            concurrency: config.worker_concurrency,
            attempts: config.job_attempts,
            backoff_delay_ms: config.backoff_delay_ms,
        },
    );

    let report = reconcile::run_reconciliation(&db_pool, &queue)
        .await
        .expect("Reconciliation failed");

    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("Failed to serialize report")
    );

    if !report.critical_desyncs.is_empty() {
        std::process::exit(1);
    }
}
