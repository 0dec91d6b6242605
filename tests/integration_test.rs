use certify_hub::{
    config::AppConfig,
    db::{self, queries},
    models::certification::CertificationStatus,
    models::job::{JobStatus, JobType},
    services::{
        certification::{CertificationService, CertifyError, CERTIFICATION_QUEUE},
        progress::{ProgressEvent, ProgressGateway},
        provider::HttpProviderAdapter,
        queue::{JobState, QueueJob, QueueOptions, QueueService},
        worker::CertificationWorker,
    },
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Integration test: idempotent enqueue flow
///
/// This test verifies the complete integration:
/// 1. Database connection and schema
/// 2. Transactional enqueue with the (model, region) uniqueness guard
/// 3. Queue backend metadata (state, counts)
/// 4. Database operations (create/read jobs and certification rows)
///
/// Note: This requires a running PostgreSQL and Redis instance
/// configured via environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_idempotent_enqueue_flow() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let queue = Arc::new(QueueService::new(&config.redis_url).expect("Failed to initialize queue"));
    queue.register(
        CERTIFICATION_QUEUE,
        QueueOptions {
            concurrency: 1,
            attempts: 3,
            backoff_delay_ms: 1000,
        },
    );

    let service = CertificationService::new(db_pool.clone(), queue.clone());

    // Test data: one throwaway deployment.
    let model_id = format!("test-model-{}", Uuid::new_v4());
    let region = "us-east";
    let tag = format!("integration-{}", Uuid::new_v4());

    sqlx::query(
        "INSERT INTO model_deployments (id, display_name, provider, active) VALUES ($1, $2, $3, TRUE)",
    )
    .bind(&model_id)
    .bind("Integration Test Model")
    .bind("test-provider")
    .execute(&db_pool)
    .await
    .expect("Failed to insert deployment");

    // 1. First request queues new work.
    let first = service
        .certify_model(&model_id, region, Some(&tag), false)
        .await
        .expect("First certify request failed");
    assert!(first.newly_queued);
    let queue_job_id = first.queue_job_id.clone().expect("No queue job id");

    // 2. Second request is deduplicated onto the same job.
    let second = service
        .certify_model(&model_id, region, Some(&tag), false)
        .await
        .expect("Second certify request failed");
    assert!(!second.newly_queued);
    assert_eq!(second.job_id, first.job_id);

    // 3. The durable row reflects the enqueue.
    let row = queries::get_certification_by_pair(&db_pool, &model_id, region)
        .await
        .expect("Failed to read certification")
        .expect("Certification row missing");
    assert_eq!(row.status, CertificationStatus::Queued);
    assert_eq!(row.job_id, Some(first.job_id));
    assert_eq!(row.queue_job_id.as_deref(), Some(queue_job_id.as_str()));

    // 4. The job aggregate was created with one sub-job.
    let job = queries::get_job(&db_pool, first.job_id)
        .await
        .expect("Failed to read job")
        .expect("Job missing");
    assert_eq!(job.job_type, JobType::SingleModel);
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.total_models, 1);
    assert_eq!(job.processed_models, 0);

    // 5. The queue backend holds exactly the one waiting job.
    let status = queue
        .job_status(CERTIFICATION_QUEUE, &queue_job_id)
        .await
        .expect("Failed to read queue job")
        .expect("Queue job missing");
    assert_eq!(status.state, JobState::Waiting);
    assert_eq!(status.attempts_made, 0);

    let counts = queue
        .queue_counts(CERTIFICATION_QUEUE)
        .await
        .expect("Failed to read counts");
    assert!(counts.waiting >= 1);

    // 6. Force re-queues even with a non-terminal row, as a recertify job.
    let forced = service
        .certify_model(&model_id, region, Some(&tag), true)
        .await
        .expect("Forced certify request failed");
    assert!(forced.newly_queued);
    assert_ne!(forced.job_id, first.job_id);

    let forced_job = queries::get_job(&db_pool, forced.job_id)
        .await
        .expect("Failed to read job")
        .expect("Job missing");
    assert_eq!(forced_job.job_type, JobType::Recertify);

    // The reset bumped the version, stranding the old queue delivery.
    let reset_row = queries::get_certification_by_pair(&db_pool, &model_id, region)
        .await
        .expect("Failed to read certification")
        .expect("Certification row missing");
    assert!(reset_row.version > row.version);

    // Cleanup
    sqlx::query("DELETE FROM model_certifications WHERE model_id = $1")
        .bind(&model_id)
        .execute(&db_pool)
        .await
        .expect("Failed to clean certifications");
    sqlx::query("DELETE FROM certification_jobs WHERE requested_by = $1")
        .bind(&tag)
        .execute(&db_pool)
        .await
        .expect("Failed to clean jobs");
    sqlx::query("DELETE FROM model_deployments WHERE id = $1")
        .bind(&model_id)
        .execute(&db_pool)
        .await
        .expect("Failed to clean deployment");
}

/// Integration test: bulk fan-out totals
///
/// Verifies that certify-all creates one sub-job per (model, region) pair,
/// skipping pairs with in-flight work, and fixes the job totals afterward.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_bulk_fanout_totals() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let queue = Arc::new(QueueService::new(&config.redis_url).expect("Failed to initialize queue"));
    queue.register(
        CERTIFICATION_QUEUE,
        QueueOptions {
            concurrency: 1,
            attempts: 3,
            backoff_delay_ms: 1000,
        },
    );

    let service = CertificationService::new(db_pool.clone(), queue.clone());

    let suffix = Uuid::new_v4();
    let model_a = format!("test-bulk-a-{suffix}");
    let model_b = format!("test-bulk-b-{suffix}");
    let tag = format!("integration-bulk-{suffix}");
    let regions = vec!["us-east".to_string(), "eu-west".to_string()];

    for (id, name) in [(&model_a, "Bulk Model A"), (&model_b, "Bulk Model B")] {
        sqlx::query(
            "INSERT INTO model_deployments (id, display_name, provider, active) VALUES ($1, $2, $3, TRUE)",
        )
        .bind(id)
        .bind(name)
        .bind("test-provider")
        .execute(&db_pool)
        .await
        .expect("Failed to insert deployment");
    }

    // Put one pair in flight first; the fan-out must skip it.
    let single = service
        .certify_model(&model_a, "us-east", Some(&tag), false)
        .await
        .expect("Single certify failed");
    assert!(single.newly_queued);

    let bulk = service
        .certify_all_models(&regions, Some(&tag))
        .await
        .expect("Bulk certify failed");

    // Other deployments may exist in a shared database, so the fan-out can
    // only be bounded from below: at least the three remaining test pairs.
    assert!(bulk.total_jobs >= 3);

    let status = service
        .job_status(bulk.job_id)
        .await
        .expect("Failed to read job status");
    assert_eq!(status.job.job_type, JobType::AllModels);
    assert_eq!(status.job.total_models, bulk.total_jobs);
    assert_eq!(status.job.processed_models, 0);
    assert_eq!(status.certifications.len() as i32, bulk.total_jobs);
    assert!(status
        .certifications
        .iter()
        .all(|c| c.status == CertificationStatus::Queued && c.queue_job_id.is_some()));
    // The skipped pair still belongs to the single-model job.
    assert!(!status
        .certifications
        .iter()
        .any(|c| c.model_id == model_a && c.region == "us-east"));

    // Cleanup
    for model in [&model_a, &model_b] {
        sqlx::query("DELETE FROM model_certifications WHERE model_id = $1")
            .bind(model)
            .execute(&db_pool)
            .await
            .expect("Failed to clean certifications");
    }
    sqlx::query("DELETE FROM certification_jobs WHERE requested_by = $1")
        .bind(&tag)
        .execute(&db_pool)
        .await
        .expect("Failed to clean jobs");
    sqlx::query("DELETE FROM model_deployments WHERE id = ANY($1)")
        .bind(vec![model_a, model_b])
        .execute(&db_pool)
        .await
        .expect("Failed to clean deployments");
}

/// Integration test: queue lifecycle
///
/// Exercises add/status/promote/clean against a live Redis.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_queue_lifecycle() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let queue = QueueService::new(&config.redis_url).expect("Failed to initialize queue");
    let name = format!("lifecycle-test-{}", Uuid::new_v4());
    queue.register(
        &name,
        QueueOptions {
            concurrency: 1,
            attempts: 2,
            backoff_delay_ms: 100,
        },
    );

    queue.ping().await.expect("Redis unreachable");

    let job_id = Uuid::new_v4().to_string();
    queue
        .add_job(&name, &job_id, serde_json::json!({ "lifecycle": true }))
        .await
        .expect("Failed to enqueue");

    let status = queue
        .job_status(&name, &job_id)
        .await
        .expect("Failed to read status")
        .expect("Job metadata missing");
    assert_eq!(status.state, JobState::Waiting);
    assert_eq!(status.attempts_made, 0);
    assert!(status.returnvalue.is_none());

    let counts = queue.queue_counts(&name).await.expect("Failed to count");
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.delayed, 0);

    // Nothing is delayed, so nothing promotes.
    let promoted = queue.promote_due_jobs(&name).await.expect("Promote failed");
    assert_eq!(promoted, 0);

    // Waiting jobs are not terminal; cleaning must not touch them.
    let purged = queue.clean_queue(&name, 0).await.expect("Clean failed");
    assert_eq!(purged, 0);

    let counts = queue.queue_counts(&name).await.expect("Failed to count");
    assert_eq!(counts.waiting, 1);
}

/// Integration test: progress stream across processes
///
/// The API server and the worker each hold their own gateway, so events
/// must travel between separate gateway instances through Redis.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_progress_events_cross_gateway_instances() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let publisher = ProgressGateway::new(&config.redis_url).expect("Failed to build gateway");
    let subscriber = ProgressGateway::new(&config.redis_url).expect("Failed to build gateway");

    let certification_id = Uuid::new_v4();
    let mut rx = subscriber.subscribe(certification_id).await;

    publisher
        .publish(certification_id, ProgressEvent::message("crossing processes"))
        .await;

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("No event within deadline")
        .expect("Stream closed");
    match event {
        ProgressEvent::Progress { message, .. } => {
            assert_eq!(message.as_deref(), Some("crossing processes"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    subscriber.close(certification_id);
}

/// Integration test: enqueue failure compensation
///
/// When the queue backend is down after the row commits, the row must be
/// failed terminally and its slot in the parent job resolved, so later
/// requests are not deduplicated onto work that will never run.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_enqueue_failure_resolves_row_and_job() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    // Port 1 never hosts a Redis, so every enqueue fails.
    let dead_queue =
        Arc::new(QueueService::new("redis://127.0.0.1:1").expect("Failed to build queue"));
    dead_queue.register(
        CERTIFICATION_QUEUE,
        QueueOptions {
            concurrency: 1,
            attempts: 3,
            backoff_delay_ms: 1000,
        },
    );

    let service = CertificationService::new(db_pool.clone(), dead_queue);

    let model_id = format!("test-deadqueue-{}", Uuid::new_v4());
    let region = "us-east";
    let tag = format!("integration-deadqueue-{}", Uuid::new_v4());

    sqlx::query(
        "INSERT INTO model_deployments (id, display_name, provider, active) VALUES ($1, $2, $3, TRUE)",
    )
    .bind(&model_id)
    .bind("Dead Queue Model")
    .bind("test-provider")
    .execute(&db_pool)
    .await
    .expect("Failed to insert deployment");

    let err = service
        .certify_model(&model_id, region, Some(&tag), false)
        .await
        .expect_err("Enqueue should fail with the queue down");
    assert!(matches!(err, CertifyError::Queue(_)));

    // The row is terminal with a categorized, temporary error.
    let row = queries::get_certification_by_pair(&db_pool, &model_id, region)
        .await
        .expect("Failed to read certification")
        .expect("Certification row missing");
    assert_eq!(row.status, CertificationStatus::Failed);
    assert_eq!(row.error_category.as_deref(), Some("UNAVAILABLE"));
    assert_eq!(row.error_temporary, Some(true));

    // The parent job resolved its only slot as a failure.
    let job = queries::get_job(&db_pool, row.job_id.expect("Row lost its job"))
        .await
        .expect("Failed to read job")
        .expect("Job missing");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_models, 1);
    assert_eq!(job.failure_count, 1);

    // A later request starts fresh instead of reusing the dead job.
    let retry = service.certify_model(&model_id, region, Some(&tag), false).await;
    assert!(matches!(retry, Err(CertifyError::Queue(_))));
    let retry_row = queries::get_certification_by_pair(&db_pool, &model_id, region)
        .await
        .expect("Failed to read certification")
        .expect("Certification row missing");
    assert_ne!(retry_row.job_id, row.job_id);

    // Cleanup
    sqlx::query("DELETE FROM model_certifications WHERE model_id = $1")
        .bind(&model_id)
        .execute(&db_pool)
        .await
        .expect("Failed to clean certifications");
    sqlx::query("DELETE FROM certification_jobs WHERE requested_by = $1")
        .bind(&tag)
        .execute(&db_pool)
        .await
        .expect("Failed to clean jobs");
    sqlx::query("DELETE FROM model_deployments WHERE id = $1")
        .bind(&model_id)
        .execute(&db_pool)
        .await
        .expect("Failed to clean deployment");
}

/// Integration test: force re-queue supersedes the in-flight job
///
/// A force request while a pair is still queued must resolve the old
/// parent job at reset time, and the worker must drop the old queue
/// delivery without touching any counters.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_force_supersede_resolves_old_job() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let queue = Arc::new(QueueService::new(&config.redis_url).expect("Failed to initialize queue"));
    queue.register(
        CERTIFICATION_QUEUE,
        QueueOptions {
            concurrency: 1,
            attempts: 3,
            backoff_delay_ms: 1000,
        },
    );

    let service = CertificationService::new(db_pool.clone(), queue.clone());

    let model_id = format!("test-supersede-{}", Uuid::new_v4());
    let region = "us-east";
    let tag = format!("integration-supersede-{}", Uuid::new_v4());

    sqlx::query(
        "INSERT INTO model_deployments (id, display_name, provider, active) VALUES ($1, $2, $3, TRUE)",
    )
    .bind(&model_id)
    .bind("Supersede Model")
    .bind("test-provider")
    .execute(&db_pool)
    .await
    .expect("Failed to insert deployment");

    let first = service
        .certify_model(&model_id, region, Some(&tag), false)
        .await
        .expect("First certify request failed");
    let forced = service
        .certify_model(&model_id, region, Some(&tag), true)
        .await
        .expect("Forced certify request failed");
    assert_ne!(forced.job_id, first.job_id);

    // The superseded job resolved its slot as a failure at reset time.
    let old_job = queries::get_job(&db_pool, first.job_id)
        .await
        .expect("Failed to read job")
        .expect("Old job missing");
    assert_eq!(old_job.status, JobStatus::Completed);
    assert_eq!(old_job.processed_models, 1);
    assert_eq!(old_job.failure_count, 1);

    let new_job = queries::get_job(&db_pool, forced.job_id)
        .await
        .expect("Failed to read job")
        .expect("New job missing");
    assert_eq!(new_job.status, JobStatus::Queued);
    assert_eq!(new_job.processed_models, 0);

    // The row now belongs to the forced job.
    let row = queries::get_certification_by_pair(&db_pool, &model_id, region)
        .await
        .expect("Failed to read certification")
        .expect("Certification row missing");
    assert_eq!(row.job_id, Some(forced.job_id));

    // The old queue delivery is dropped without advancing any counters.
    let worker = CertificationWorker::new(
        db_pool.clone(),
        Arc::new(HttpProviderAdapter::new("http://127.0.0.1:1", "test")),
        Arc::new(ProgressGateway::new(&config.redis_url).expect("Failed to build gateway")),
        Duration::from_secs(5),
        3,
    );
    let result = worker
        .handle(QueueJob {
            id: first.queue_job_id.expect("First receipt lost its queue job id"),
            payload: serde_json::json!({
                "certification_id": row.id,
                "model_id": model_id,
                "region": region,
                "job_id": first.job_id,
            }),
            attempts_made: 0,
        })
        .await
        .expect("Stale delivery should resolve cleanly");
    assert_eq!(result.get("superseded").and_then(|v| v.as_bool()), Some(true));

    let old_job_after = queries::get_job(&db_pool, first.job_id)
        .await
        .expect("Failed to read job")
        .expect("Old job missing");
    assert_eq!(old_job_after.processed_models, old_job.processed_models);
    assert_eq!(old_job_after.failure_count, old_job.failure_count);

    // Cleanup
    sqlx::query("DELETE FROM model_certifications WHERE model_id = $1")
        .bind(&model_id)
        .execute(&db_pool)
        .await
        .expect("Failed to clean certifications");
    sqlx::query("DELETE FROM certification_jobs WHERE requested_by = $1")
        .bind(&tag)
        .execute(&db_pool)
        .await
        .expect("Failed to clean jobs");
    sqlx::query("DELETE FROM model_deployments WHERE id = $1")
        .bind(&model_id)
        .execute(&db_pool)
        .await
        .expect("Failed to clean deployment");
}
