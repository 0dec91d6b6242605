//! Certification domain service: idempotent enqueue, bulk fan-out, and
//! job-level status aggregation.
//!
//! Idempotency is enforced transactionally against the durable store
//! (`SELECT ... FOR UPDATE` on the unique (model, region) row), not with
//! an in-memory guard, because enqueue paths are multi-producer:
//! interactive requests, bulk fan-out, and operator scripts can race.

use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::api::{JobStatusResponse, QueueStatsResponse};
use crate::models::job::JobType;
use crate::services::error_category::categorize;
use crate::services::queue::{QueueError, QueueService};

/// Name of the queue certification jobs run on.
pub const CERTIFICATION_QUEUE: &str = "model-certification";

/// Reference returned from an accepted (or deduplicated) request.
#[derive(Debug, Clone)]
pub struct CertifyReceipt {
    pub job_id: Uuid,
    pub queue_job_id: Option<String>,
    /// False when an existing in-flight certification was reused.
    pub newly_queued: bool,
}

#[derive(Debug, Clone)]
pub struct BulkReceipt {
    pub job_id: Uuid,
    pub total_jobs: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum CertifyError {
    #[error("model not found or inactive: {0}")]
    ModelNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub struct CertificationService {
    db: PgPool,
    queue: Arc<QueueService>,
}

impl CertificationService {
    pub fn new(db: PgPool, queue: Arc<QueueService>) -> Self {
        Self { db, queue }
    }

    /// Request certification of one (model, region) pair.
    ///
    /// If a non-terminal certification already exists for the pair and
    /// `force` is false, the existing job reference is returned and no new
    /// work is created.
    pub async fn certify_model(
        &self,
        model_id: &str,
        region: &str,
        requested_by: Option<&str>,
        force: bool,
    ) -> Result<CertifyReceipt, CertifyError> {
        queries::get_active_deployment(&self.db, model_id)
            .await?
            .ok_or_else(|| CertifyError::ModelNotFound(model_id.to_string()))?;

        let mut tx = self.db.begin().await?;

        let existing = queries::lock_certification(&mut tx, model_id, region).await?;
        if let Some(row) = &existing {
            if !row.status.is_terminal() && !force {
                if let Some(job_id) = row.job_id {
                    tx.rollback().await?;
                    tracing::info!(
                        model_id = %model_id,
                        region = %region,
                        job_id = %job_id,
                        "idempotent short-circuit, reusing in-flight certification"
                    );
                    return Ok(CertifyReceipt {
                        job_id,
                        queue_job_id: row.queue_job_id.clone(),
                        newly_queued: false,
                    });
                }
            }
        }

        let job_type = if existing.is_some() && force {
            JobType::Recertify
        } else {
            JobType::SingleModel
        };

        // A force re-queue supersedes any in-flight run for this pair. Its
        // old parent job would otherwise wait forever for a result that the
        // version guard will now reject, so resolve it here, inside the
        // same transaction that resets the row.
        if force {
            if let Some(old_job_id) = existing
                .as_ref()
                .filter(|row| !row.status.is_terminal())
                .and_then(|row| row.job_id)
            {
                if let Some((processed, total)) =
                    queries::advance_job_progress(&mut tx, old_job_id, false).await?
                {
                    if processed >= total {
                        queries::complete_job_if_done(&mut tx, old_job_id).await?;
                    }
                }
                tracing::info!(
                    model_id = %model_id,
                    region = %region,
                    old_job_id = %old_job_id,
                    "force re-queue superseding in-flight certification"
                );
            }
        }

        let job_id = queries::create_job(
            &mut tx,
            job_type,
            &[region.to_string()],
            &[model_id.to_string()],
            1,
            requested_by,
        )
        .await?;
        let queue_job_id = Uuid::new_v4().to_string();
        let certification_id = queries::upsert_queued_certification(
            &mut tx,
            model_id,
            region,
            job_id,
            &queue_job_id,
        )
        .await?;

        tx.commit().await?;

        if let Err(e) = self
            .queue
            .add_job(
                CERTIFICATION_QUEUE,
                &queue_job_id,
                json!({
                    "certification_id": certification_id,
                    "model_id": model_id,
                    "region": region,
                    "job_id": job_id,
                }),
            )
            .await
        {
            self.abandon_enqueue(certification_id, job_id, &e).await?;
            return Err(e.into());
        }

        metrics::counter!("certification_jobs_enqueued_total").increment(1);
        tracing::info!(
            model_id = %model_id,
            region = %region,
            job_id = %job_id,
            queue_job_id = %queue_job_id,
            "certification enqueued"
        );

        Ok(CertifyReceipt {
            job_id,
            queue_job_id: Some(queue_job_id),
            newly_queued: true,
        })
    }

    /// Compensation for a committed row whose queue job never materialized:
    /// fail the row terminally and resolve its slot in the parent job, so
    /// later requests are not deduplicated onto work that will never run.
    async fn abandon_enqueue(
        &self,
        certification_id: Uuid,
        job_id: Uuid,
        cause: &QueueError,
    ) -> Result<(), CertifyError> {
        let error = categorize(&cause.to_string());
        queries::abandon_certification(&self.db, certification_id, &error).await?;

        let mut conn = self.db.acquire().await?;
        if let Some((processed, total)) =
            queries::advance_job_progress(&mut conn, job_id, false).await?
        {
            if processed >= total {
                queries::complete_job_if_done(&mut conn, job_id).await?;
            }
        }

        metrics::counter!("certification_enqueue_failures_total").increment(1);
        tracing::error!(
            certification_id = %certification_id,
            job_id = %job_id,
            error = %cause,
            "enqueue failed after commit, certification abandoned"
        );
        Ok(())
    }

    /// Certify every active deployment across the given regions. Pairs with
    /// an in-flight certification are skipped under the same idempotency
    /// rule; `total_models` counts only newly queued pairs.
    pub async fn certify_all_models(
        &self,
        regions: &[String],
        requested_by: Option<&str>,
    ) -> Result<BulkReceipt, CertifyError> {
        let deployments = queries::get_active_deployments(&self.db).await?;

        let mut tx = self.db.begin().await?;
        let job_id = queries::create_job(
            &mut tx,
            JobType::AllModels,
            regions,
            &[],
            0,
            requested_by,
        )
        .await?;

        let mut queued: Vec<(Uuid, String, String, String)> = Vec::new();
        for deployment in &deployments {
            for region in regions {
                let existing = queries::lock_certification(&mut tx, &deployment.id, region).await?;
                if existing.as_ref().is_some_and(|row| !row.status.is_terminal()) {
                    continue;
                }
                let queue_job_id = Uuid::new_v4().to_string();
                let certification_id = queries::upsert_queued_certification(
                    &mut tx,
                    &deployment.id,
                    region,
                    job_id,
                    &queue_job_id,
                )
                .await?;
                queued.push((
                    certification_id,
                    queue_job_id,
                    deployment.id.clone(),
                    region.clone(),
                ));
            }
        }

        let model_ids: Vec<String> = queued.iter().map(|(_, _, m, _)| m.clone()).collect();
        let total = queued.len() as i32;
        queries::set_job_totals(&mut tx, job_id, total, &model_ids).await?;
        tx.commit().await?;

        let mut enqueued: u64 = 0;
        for (certification_id, queue_job_id, model_id, region) in &queued {
            let added = self
                .queue
                .add_job(
                    CERTIFICATION_QUEUE,
                    queue_job_id,
                    json!({
                        "certification_id": certification_id,
                        "model_id": model_id,
                        "region": region,
                        "job_id": job_id,
                    }),
                )
                .await;
            match added {
                Ok(()) => enqueued += 1,
                Err(e) => self.abandon_enqueue(*certification_id, job_id, &e).await?,
            }
        }

        metrics::counter!("certification_jobs_enqueued_total").increment(enqueued);
        tracing::info!(
            job_id = %job_id,
            regions = ?regions,
            total_jobs = total,
            skipped = deployments.len() as i32 * regions.len() as i32 - total,
            "bulk certification enqueued"
        );

        Ok(BulkReceipt { job_id, total_jobs: total })
    }

    /// Job aggregate plus its per-pair rows. Reflects durable-store state
    /// only, never queue-side state.
    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusResponse, CertifyError> {
        let job = queries::get_job(&self.db, job_id)
            .await?
            .ok_or(CertifyError::JobNotFound(job_id))?;
        let certifications = queries::get_certifications_for_job(&self.db, job_id).await?;
        Ok(JobStatusResponse { job, certifications })
    }

    /// Live queue counts merged with durable aggregates for observability.
    pub async fn queue_stats(&self) -> Result<QueueStatsResponse, CertifyError> {
        let queue = self.queue.queue_counts(CERTIFICATION_QUEUE).await?;
        let db = queries::status_aggregate(&self.db).await?;
        Ok(QueueStatsResponse { queue, db })
    }
}
