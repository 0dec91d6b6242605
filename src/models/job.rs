use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// What kind of certification request a job aggregates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    SingleModel,
    MultipleModels,
    AllModels,
    Recertify,
}

/// Status of a certification job aggregate.
///
/// Transitions are forward-only: pending → queued → processing → terminal.
/// Cancelled and paused exist for operator tooling; no orchestrator path
/// sets them, since in-flight work cannot be cancelled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

/// Aggregate tracking one orchestration request and its sub-job counters.
///
/// Invariants: `processed_models <= total_models` always; once completed,
/// `success_count + failure_count == processed_models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificationJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub regions: Vec<String>,
    pub model_ids: Vec<String>,
    pub status: JobStatus,
    pub total_models: i32,
    pub processed_models: i32,
    pub success_count: i32,
    pub failure_count: i32,
    pub requested_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}
