use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a per-(model, region) certification record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CertificationStatus {
    Pending,
    Queued,
    Processing,
    Certified,
    Failed,
    QualityWarning,
    Cancelled,
}

impl CertificationStatus {
    /// Terminal records are never reused by the idempotent enqueue check;
    /// a new request for the pair resets the row instead.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CertificationStatus::Certified
                | CertificationStatus::Failed
                | CertificationStatus::QualityWarning
                | CertificationStatus::Cancelled
        )
    }
}

/// Coarse quality tier derived from the certification score.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Badge {
    None,
    Silver,
    Gold,
    Platinum,
}

/// The durable per-(model, region) certification record.
///
/// Exactly one row exists per (model_id, region) pair; `version` is the
/// monotonic guard for terminal writes so duplicate queue deliveries cannot
/// clobber an already-terminal row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCertification {
    pub id: Uuid,
    pub model_id: String,
    pub region: String,
    pub status: CertificationStatus,
    pub passed: Option<bool>,
    pub score: Option<f64>,
    pub rating: Option<String>,
    pub badge: Badge,
    pub error_category: Option<String>,
    pub error_severity: Option<String>,
    pub error_temporary: Option<bool>,
    pub last_error: Option<String>,
    pub tests_passed: i32,
    pub tests_failed: i32,
    pub success_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub job_id: Option<Uuid>,
    pub queue_job_id: Option<String>,
    pub version: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The terminal result a worker computed for one certification, applied to
/// the durable row via a version-guarded write.
#[derive(Debug, Clone, Serialize)]
pub struct CertificationOutcome {
    pub status: CertificationStatus,
    pub passed: bool,
    pub score: f64,
    pub rating: String,
    pub badge: Badge,
    pub tests_passed: i32,
    pub tests_failed: i32,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub error: Option<crate::services::error_category::CategorizedError>,
}

/// A model deployment eligible for certification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDeployment {
    pub id: String,
    pub display_name: String,
    pub provider: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(CertificationStatus::Certified.is_terminal());
        assert!(CertificationStatus::Failed.is_terminal());
        assert!(CertificationStatus::QualityWarning.is_terminal());
        assert!(CertificationStatus::Cancelled.is_terminal());
        assert!(!CertificationStatus::Pending.is_terminal());
        assert!(!CertificationStatus::Queued.is_terminal());
        assert!(!CertificationStatus::Processing.is_terminal());
    }

    #[test]
    fn status_string_round_trip() {
        let s: CertificationStatus = "quality_warning".parse().unwrap();
        assert_eq!(s, CertificationStatus::QualityWarning);
        assert_eq!(s.to_string(), "quality_warning");
        assert_eq!(Badge::Platinum.to_string(), "platinum");
    }
}
