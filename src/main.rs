mod app_state;
mod config;
mod db;
mod models;
mod routes;
mod services;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use services::certification::{CertificationService, CERTIFICATION_QUEUE};
use services::progress::ProgressGateway;
use services::queue::{QueueOptions, QueueService};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing certify-hub API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "certification_jobs_enqueued_total",
        "Total certification jobs enqueued"
    );
    metrics::describe_counter!(
        "certification_enqueue_failures_total",
        "Certification rows abandoned because their queue job could not be created"
    );
    metrics::describe_counter!(
        "certifications_completed_total",
        "Total certifications that resolved as certified"
    );
    metrics::describe_counter!(
        "certifications_failed_total",
        "Total certifications that resolved as failed or quality_warning"
    );
    metrics::describe_histogram!(
        "certification_duration_seconds",
        "Wall-clock time to resolve one certification"
    );
    metrics::describe_gauge!(
        "certification_queue_depth",
        "Current number of waiting jobs in the certification queue"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize Redis job queue
    tracing::info!("Connecting to Redis job queue");
    let queue = Arc::new(
        QueueService::new(&config.redis_url).expect("Failed to initialize job queue"),
    );
    queue.register(
        CERTIFICATION_QUEUE,
        QueueOptions {
            concurrency: config.worker_concurrency,
            attempts: config.job_attempts,
            backoff_delay_ms: config.backoff_delay_ms,
        },
    );

    // Initialize domain services
    let certification = CertificationService::new(db_pool.clone(), queue.clone());
    let progress = Arc::new(
        ProgressGateway::new(&config.redis_url).expect("Failed to initialize progress relay"),
    );

    // Create shared application state
    let state = AppState::new(db_pool, queue, certification, progress);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/certifications",
            post(routes::certify::certify_model),
        )
        .route(
            "/api/v1/certifications/all",
            post(routes::certify::certify_all_models),
        )
        .route(
            "/api/v1/certifications/jobs/{job_id}",
            get(routes::certify::get_job_status),
        )
        .route(
            "/api/v1/certifications/stats",
            get(routes::certify::get_queue_stats),
        )
        .route(
            "/api/v1/certifications/reconcile",
            get(routes::certify::get_reconcile_report),
        )
        .route(
            "/api/v1/certifications/{id}/events",
            get(routes::certify::certification_events),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024)); // 64 KB limit

    tracing::info!("Starting certify-hub on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
