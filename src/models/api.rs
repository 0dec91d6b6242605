use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::certification::ModelCertification;
use crate::models::job::CertificationJob;
use crate::services::queue::QueueCounts;

/// Request to certify a single model deployment in one region.
#[derive(Debug, Deserialize, Validate)]
pub struct CertifyRequest {
    #[garde(length(min = 1, max = 200))]
    pub model_id: String,

    #[garde(length(min = 1, max = 64))]
    pub region: String,

    /// Re-certify even if a non-terminal certification already exists.
    #[serde(default)]
    #[garde(skip)]
    pub force: bool,
}

/// Request to certify every active deployment across the given regions.
#[derive(Debug, Deserialize, Validate)]
pub struct CertifyAllRequest {
    #[garde(length(min = 1, max = 32), inner(length(min = 1, max = 64)))]
    pub regions: Vec<String>,
}

/// Response after accepting a single certification request.
#[derive(Debug, Serialize)]
pub struct CertifyResponse {
    pub job_id: Uuid,
    pub queue_job_id: Option<String>,
    pub status: String,
}

/// Response after accepting a bulk certification request.
#[derive(Debug, Serialize)]
pub struct CertifyAllResponse {
    pub job_id: Uuid,
    pub total_jobs: i32,
}

/// Job aggregate plus its per-(model, region) sub-records.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job: CertificationJob,
    pub certifications: Vec<ModelCertification>,
}

/// Per-status row counts from the durable store.
#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

/// Live queue counts merged with durable aggregates. The two converge but
/// are not forced to match instantaneously.
#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub queue: QueueCounts,
    pub db: Vec<StatusCount>,
}
