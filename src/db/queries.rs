use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::models::api::StatusCount;
use crate::models::certification::{
    Badge, CertificationOutcome, CertificationStatus, ModelCertification, ModelDeployment,
};
use crate::models::job::{CertificationJob, JobStatus, JobType};
use crate::services::error_category::CategorizedError;

/// Minimal view of a certification row taken under `FOR UPDATE`.
#[derive(Debug, Clone)]
pub struct CertificationRef {
    pub id: Uuid,
    pub status: CertificationStatus,
    pub job_id: Option<Uuid>,
    pub queue_job_id: Option<String>,
    pub version: i32,
}

/// Look up one active model deployment.
pub async fn get_active_deployment(
    pool: &PgPool,
    model_id: &str,
) -> Result<Option<ModelDeployment>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, display_name, provider, active
        FROM model_deployments
        WHERE id = $1 AND active = TRUE
        "#,
    )
    .bind(model_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| map_deployment(&r)).transpose()
}

/// All active model deployments, for bulk certification fan-out.
pub async fn get_active_deployments(pool: &PgPool) -> Result<Vec<ModelDeployment>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, display_name, provider, active
        FROM model_deployments
        WHERE active = TRUE
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_deployment).collect()
}

/// Row-lock the (model, region) certification record for the idempotency
/// check. Must run inside a transaction; the lock serializes racing
/// producers on the same pair.
pub async fn lock_certification(
    conn: &mut PgConnection,
    model_id: &str,
    region: &str,
) -> Result<Option<CertificationRef>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, status, job_id, queue_job_id, version
        FROM model_certifications
        WHERE model_id = $1 AND region = $2
        FOR UPDATE
        "#,
    )
    .bind(model_id)
    .bind(region)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(match row {
        Some(r) => Some(CertificationRef {
            id: r.try_get("id")?,
            status: parse_cert_status(&r)?,
            job_id: r.try_get("job_id")?,
            queue_job_id: r.try_get("queue_job_id")?,
            version: r.try_get("version")?,
        }),
        None => None,
    })
}

/// Create the row queued, or reset an existing (terminal or forced) row.
/// The queue job id is bound here, before the queue job exists, so the row
/// always names its one legitimate delivery. The version bump on reset
/// invalidates any in-flight CAS writer from a previous run of the pair.
pub async fn upsert_queued_certification(
    conn: &mut PgConnection,
    model_id: &str,
    region: &str,
    job_id: Uuid,
    queue_job_id: &str,
) -> Result<Uuid, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO model_certifications (model_id, region, status, job_id, queue_job_id)
        VALUES ($1, $2, 'queued', $3, $4)
        ON CONFLICT (model_id, region) DO UPDATE
        SET status = 'queued', passed = NULL, score = NULL, rating = NULL,
            badge = 'none', error_category = NULL, error_severity = NULL,
            error_temporary = NULL, last_error = NULL,
            tests_passed = 0, tests_failed = 0, success_rate = NULL,
            avg_latency_ms = NULL, job_id = $3, queue_job_id = $4,
            version = model_certifications.version + 1,
            started_at = NULL, completed_at = NULL, duration_ms = NULL,
            updated_at = NOW()
        RETURNING id
        "#,
    )
    .bind(model_id)
    .bind(region)
    .bind(job_id)
    .bind(queue_job_id)
    .fetch_one(&mut *conn)
    .await?;

    row.try_get("id")
}

/// Insert a new certification job aggregate.
pub async fn create_job(
    conn: &mut PgConnection,
    job_type: JobType,
    regions: &[String],
    model_ids: &[String],
    total_models: i32,
    requested_by: Option<&str>,
) -> Result<Uuid, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO certification_jobs (job_type, regions, model_ids, status, total_models, requested_by)
        VALUES ($1, $2, $3, 'queued', $4, $5)
        RETURNING id
        "#,
    )
    .bind(job_type.to_string())
    .bind(regions)
    .bind(model_ids)
    .bind(total_models)
    .bind(requested_by)
    .fetch_one(&mut *conn)
    .await?;

    row.try_get("id")
}

/// Fix up a bulk job's totals once the fan-out is known. A zero-pair job
/// (everything already in flight) completes immediately.
pub async fn set_job_totals(
    conn: &mut PgConnection,
    job_id: Uuid,
    total_models: i32,
    model_ids: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE certification_jobs
        SET total_models = $2,
            model_ids = $3,
            status = CASE WHEN $2 = 0 THEN 'completed' ELSE status END,
            completed_at = CASE WHEN $2 = 0 THEN NOW() ELSE completed_at END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(total_models)
    .bind(model_ids)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// CAS the row into processing. Returns the new version, or None if the
/// row moved on (duplicate delivery against a terminal or reset row).
pub async fn begin_processing(
    pool: &PgPool,
    certification_id: Uuid,
    expected_version: i32,
) -> Result<Option<i32>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE model_certifications
        SET status = 'processing',
            started_at = COALESCE(started_at, NOW()),
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1 AND version = $2
          AND status IN ('pending', 'queued', 'processing')
        RETURNING version
        "#,
    )
    .bind(certification_id)
    .bind(expected_version)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_get("version")).transpose()
}

/// First sub-job moves the aggregate to processing.
pub async fn mark_job_processing(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE certification_jobs
        SET status = 'processing',
            started_at = COALESCE(started_at, NOW()),
            updated_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'queued')
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the raw error of a non-final attempt (the row stays processing
/// while the queue retries). The status guard keeps a straggling attempt
/// from scribbling on a row that was since reset or resolved.
pub async fn record_attempt_error(
    pool: &PgPool,
    certification_id: Uuid,
    last_error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE model_certifications
        SET last_error = $2, updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(certification_id)
    .bind(last_error)
    .execute(pool)
    .await?;

    Ok(())
}

/// Terminally fail a row whose queue job could not be created, so later
/// requests for the pair do not short-circuit onto a job that never ran.
pub async fn abandon_certification(
    pool: &PgPool,
    certification_id: Uuid,
    error: &CategorizedError,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE model_certifications
        SET status = 'failed', passed = FALSE, score = 0, rating = 'poor',
            badge = 'none', error_category = $2, error_severity = $3,
            error_temporary = $4, last_error = $5,
            completed_at = NOW(), duration_ms = 0,
            version = version + 1, updated_at = NOW()
        WHERE id = $1 AND status = 'queued'
        "#,
    )
    .bind(certification_id)
    .bind(error.category.to_string())
    .bind(error.severity.to_string())
    .bind(error.is_temporary)
    .bind(&error.message)
    .execute(pool)
    .await?;

    Ok(())
}

/// Version-guarded terminal write. Returns false when the CAS loses, i.e.
/// a duplicate or out-of-order delivery tried to overwrite newer state.
pub async fn finish_certification(
    pool: &PgPool,
    certification_id: Uuid,
    expected_version: i32,
    outcome: &CertificationOutcome,
) -> Result<bool, sqlx::Error> {
    let (category, severity, temporary, last_error) = match &outcome.error {
        Some(e) => (
            Some(e.category.to_string()),
            Some(e.severity.to_string()),
            Some(e.is_temporary),
            Some(e.message.clone()),
        ),
        None => (None, None, None, None),
    };

    let result = sqlx::query(
        r#"
        UPDATE model_certifications
        SET status = $3, passed = $4, score = $5, rating = $6, badge = $7,
            error_category = $8, error_severity = $9, error_temporary = $10,
            last_error = $11, tests_passed = $12, tests_failed = $13,
            success_rate = $14, avg_latency_ms = $15,
            completed_at = NOW(),
            duration_ms = (EXTRACT(EPOCH FROM (NOW() - COALESCE(started_at, NOW()))) * 1000)::BIGINT,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1 AND version = $2
          AND status NOT IN ('certified', 'failed', 'quality_warning', 'cancelled')
        "#,
    )
    .bind(certification_id)
    .bind(expected_version)
    .bind(outcome.status.to_string())
    .bind(outcome.passed)
    .bind(outcome.score)
    .bind(&outcome.rating)
    .bind(outcome.badge.to_string())
    .bind(category)
    .bind(severity)
    .bind(temporary)
    .bind(last_error)
    .bind(outcome.tests_passed)
    .bind(outcome.tests_failed)
    .bind(outcome.success_rate)
    .bind(outcome.avg_latency_ms)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Atomically advance the parent job's counters. The `processed < total`
/// guard keeps `processed_models <= total_models` even under anomalies.
/// Returns (processed_models, total_models) after the bump, or None if the
/// counters were already saturated. Takes a connection so force-supersede
/// resolution can run inside the enqueue transaction.
pub async fn advance_job_progress(
    conn: &mut PgConnection,
    job_id: Uuid,
    success: bool,
) -> Result<Option<(i32, i32)>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE certification_jobs
        SET processed_models = processed_models + 1,
            success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
            failure_count = failure_count + CASE WHEN $2 THEN 0 ELSE 1 END,
            updated_at = NOW()
        WHERE id = $1 AND processed_models < total_models
        RETURNING processed_models, total_models
        "#,
    )
    .bind(job_id)
    .bind(success)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(match row {
        Some(r) => Some((r.try_get("processed_models")?, r.try_get("total_models")?)),
        None => None,
    })
}

/// Transition the job to completed once every sub-job has resolved.
/// Returns true if this call performed the transition.
pub async fn complete_job_if_done(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE certification_jobs
        SET status = 'completed',
            completed_at = NOW(),
            duration_ms = (EXTRACT(EPOCH FROM (NOW() - COALESCE(started_at, created_at))) * 1000)::BIGINT,
            updated_at = NOW()
        WHERE id = $1 AND processed_models >= total_models
          AND status IN ('queued', 'processing')
        "#,
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a job aggregate.
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<CertificationJob>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, job_type, regions, model_ids, status, total_models,
               processed_models, success_count, failure_count, requested_by,
               started_at, completed_at, duration_ms, created_at
        FROM certification_jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| map_job(&r)).transpose()
}

/// Fetch a certification record by id.
pub async fn get_certification(
    pool: &PgPool,
    certification_id: Uuid,
) -> Result<Option<ModelCertification>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "{CERTIFICATION_COLUMNS} WHERE id = $1"
    ))
    .bind(certification_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| map_certification(&r)).transpose()
}

/// Fetch the certification record for a (model, region) pair.
pub async fn get_certification_by_pair(
    pool: &PgPool,
    model_id: &str,
    region: &str,
) -> Result<Option<ModelCertification>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "{CERTIFICATION_COLUMNS} WHERE model_id = $1 AND region = $2"
    ))
    .bind(model_id)
    .bind(region)
    .fetch_optional(pool)
    .await?;

    row.map(|r| map_certification(&r)).transpose()
}

/// All sub-records of one job, for the status endpoint.
pub async fn get_certifications_for_job(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Vec<ModelCertification>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "{CERTIFICATION_COLUMNS} WHERE job_id = $1 ORDER BY model_id, region"
    ))
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_certification).collect()
}

/// Every row reconciliation must look at: rows referencing a queue job,
/// plus non-terminal rows that never got one (those are drift too).
pub async fn certifications_to_reconcile(
    pool: &PgPool,
) -> Result<Vec<ModelCertification>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "{CERTIFICATION_COLUMNS}
         WHERE queue_job_id IS NOT NULL
            OR status IN ('pending', 'queued', 'processing')
         ORDER BY model_id, region"
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_certification).collect()
}

/// Per-status row counts for the stats endpoint.
pub async fn status_aggregate(pool: &PgPool) -> Result<Vec<StatusCount>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT status, COUNT(*) AS count
        FROM model_certifications
        GROUP BY status
        ORDER BY status
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| {
            Ok(StatusCount {
                status: r.try_get("status")?,
                count: r.try_get("count")?,
            })
        })
        .collect()
}

const CERTIFICATION_COLUMNS: &str = r#"
    SELECT id, model_id, region, status, passed, score, rating, badge,
           error_category, error_severity, error_temporary, last_error,
           tests_passed, tests_failed, success_rate, avg_latency_ms,
           job_id, queue_job_id, version, started_at, completed_at,
           duration_ms, created_at, updated_at
    FROM model_certifications
"#;

fn parse_cert_status(row: &PgRow) -> Result<CertificationStatus, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(status.parse().unwrap_or(CertificationStatus::Pending))
}

fn map_deployment(row: &PgRow) -> Result<ModelDeployment, sqlx::Error> {
    Ok(ModelDeployment {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        provider: row.try_get("provider")?,
        active: row.try_get("active")?,
    })
}

fn map_job(row: &PgRow) -> Result<CertificationJob, sqlx::Error> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;

    Ok(CertificationJob {
        id: row.try_get("id")?,
        job_type: job_type.parse().unwrap_or(JobType::SingleModel),
        regions: row.try_get("regions")?,
        model_ids: row.try_get("model_ids")?,
        status: status.parse().unwrap_or(JobStatus::Pending),
        total_models: row.try_get("total_models")?,
        processed_models: row.try_get("processed_models")?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        requested_by: row.try_get("requested_by")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_certification(row: &PgRow) -> Result<ModelCertification, sqlx::Error> {
    let badge: String = row.try_get("badge")?;

    Ok(ModelCertification {
        id: row.try_get("id")?,
        model_id: row.try_get("model_id")?,
        region: row.try_get("region")?,
        status: parse_cert_status(row)?,
        passed: row.try_get("passed")?,
        score: row.try_get("score")?,
        rating: row.try_get("rating")?,
        badge: badge.parse().unwrap_or(Badge::None),
        error_category: row.try_get("error_category")?,
        error_severity: row.try_get("error_severity")?,
        error_temporary: row.try_get("error_temporary")?,
        last_error: row.try_get("last_error")?,
        tests_passed: row.try_get("tests_passed")?,
        tests_failed: row.try_get("tests_failed")?,
        success_rate: row.try_get("success_rate")?,
        avg_latency_ms: row.try_get("avg_latency_ms")?,
        job_id: row.try_get("job_id")?,
        queue_job_id: row.try_get("queue_job_id")?,
        version: row.try_get("version")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
