//! Read-only reconciliation between the durable store and the queue
//! backend. Drift is reported, never repaired: the durable store is the
//! source of truth and silent "fixes" would hide lost updates.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::certification::{CertificationStatus, ModelCertification};
use crate::services::certification::CERTIFICATION_QUEUE;
use crate::services::queue::{QueueError, QueueJobStatus, QueueService};

const SCORE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Queue finished the job but the durable row never left
    /// queued/processing: a lost update from the worker.
    CriticalDesync,
    /// Both sides are terminal but disagree on passed/score.
    FieldMismatch,
    /// A non-terminal row whose queue job is gone: either its metadata was
    /// evicted, or no queue job was ever attached.
    OrphanedReference,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileIssue {
    pub kind: IssueKind,
    pub certification_id: Uuid,
    pub model_id: String,
    pub region: String,
    pub queue_job_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileCounts {
    pub critical_desyncs: usize,
    pub field_mismatches: usize,
    pub orphaned_references: usize,
}

/// Structured drift report, grouped by issue type.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub counts: ReconcileCounts,
    pub critical_desyncs: Vec<ReconcileIssue>,
    pub field_mismatches: Vec<ReconcileIssue>,
    pub orphaned_references: Vec<ReconcileIssue>,
}

impl ReconcileReport {
    fn new(scanned: usize, issues: Vec<ReconcileIssue>) -> Self {
        let mut report = Self {
            scanned,
            counts: ReconcileCounts::default(),
            critical_desyncs: Vec::new(),
            field_mismatches: Vec::new(),
            orphaned_references: Vec::new(),
        };
        for issue in issues {
            match issue.kind {
                IssueKind::CriticalDesync => report.critical_desyncs.push(issue),
                IssueKind::FieldMismatch => report.field_mismatches.push(issue),
                IssueKind::OrphanedReference => report.orphaned_references.push(issue),
            }
        }
        report.counts = ReconcileCounts {
            critical_desyncs: report.critical_desyncs.len(),
            field_mismatches: report.field_mismatches.len(),
            orphaned_references: report.orphaned_references.len(),
        };
        report
    }

    pub fn is_clean(&self) -> bool {
        self.critical_desyncs.is_empty()
            && self.field_mismatches.is_empty()
            && self.orphaned_references.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Compare one durable row against the queue's view of its job. Pure, so
/// each drift rule is testable without infrastructure.
pub fn compare(
    row: &ModelCertification,
    queue_job: Option<&QueueJobStatus>,
) -> Option<ReconcileIssue> {
    let issue = |kind: IssueKind, detail: String| ReconcileIssue {
        kind,
        certification_id: row.id,
        model_id: row.model_id.clone(),
        region: row.region.clone(),
        queue_job_id: row.queue_job_id.clone(),
        detail,
    };

    if row.queue_job_id.is_none() {
        // Enqueue compensation should have failed such a row terminally;
        // a non-terminal one means the compensation itself was lost.
        if !row.status.is_terminal() {
            return Some(issue(
                IssueKind::OrphanedReference,
                format!("row is {} but no queue job was ever attached", row.status),
            ));
        }
        return None;
    }

    let Some(queue_job) = queue_job else {
        if !row.status.is_terminal() {
            return Some(issue(
                IssueKind::OrphanedReference,
                format!("queue job evicted while row is {}", row.status),
            ));
        }
        return None;
    };

    let row_in_flight = matches!(
        row.status,
        CertificationStatus::Queued | CertificationStatus::Processing
    );
    if queue_job.finished_on.is_some() && row_in_flight {
        return Some(issue(
            IssueKind::CriticalDesync,
            format!(
                "queue finished at {} but row is still {}",
                queue_job.finished_on.unwrap_or_default(),
                row.status
            ),
        ));
    }

    if row.status.is_terminal() {
        if let Some(returnvalue) = &queue_job.returnvalue {
            let queue_passed = returnvalue.get("passed").and_then(|v| v.as_bool());
            let queue_score = returnvalue.get("score").and_then(|v| v.as_f64());

            if let (Some(qp), Some(rp)) = (queue_passed, row.passed) {
                if qp != rp {
                    return Some(issue(
                        IssueKind::FieldMismatch,
                        format!("passed: queue={qp} db={rp}"),
                    ));
                }
            }
            if let (Some(qs), Some(rs)) = (queue_score, row.score) {
                if (qs - rs).abs() > SCORE_TOLERANCE {
                    return Some(issue(
                        IssueKind::FieldMismatch,
                        format!("score: queue={qs} db={rs}"),
                    ));
                }
            }
        }
    }

    None
}

/// Audit every certification row that references a queue job, plus
/// non-terminal rows that never got one.
pub async fn run_reconciliation(
    db: &PgPool,
    queue: &QueueService,
) -> Result<ReconcileReport, ReconcileError> {
    let rows = queries::certifications_to_reconcile(db).await?;
    let mut issues = Vec::new();
    let scanned = rows.len();

    for row in &rows {
        let queue_job = match &row.queue_job_id {
            Some(id) => queue.job_status(CERTIFICATION_QUEUE, id).await?,
            None => None,
        };
        if let Some(found) = compare(row, queue_job.as_ref()) {
            tracing::warn!(
                certification_id = %found.certification_id,
                model_id = %found.model_id,
                region = %found.region,
                kind = ?found.kind,
                detail = %found.detail,
                "reconciliation drift detected"
            );
            issues.push(found);
        }
    }

    Ok(ReconcileReport::new(scanned, issues))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::certification::Badge;
    use crate::services::queue::JobState;
    use chrono::Utc;

    fn row(status: CertificationStatus) -> ModelCertification {
        ModelCertification {
            id: Uuid::new_v4(),
            model_id: "model-a".to_string(),
            region: "us-east-1".to_string(),
            status,
            passed: None,
            score: None,
            rating: None,
            badge: Badge::None,
            error_category: None,
            error_severity: None,
            error_temporary: None,
            last_error: None,
            tests_passed: 0,
            tests_failed: 0,
            success_rate: None,
            avg_latency_ms: None,
            job_id: Some(Uuid::new_v4()),
            queue_job_id: Some("qj-1".to_string()),
            version: 1,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn queue_job(state: JobState, finished: bool, returnvalue: Option<serde_json::Value>) -> QueueJobStatus {
        QueueJobStatus {
            state,
            returnvalue,
            attempts_made: 1,
            finished_on: finished.then_some(1_700_000_000_000),
            last_error: None,
        }
    }

    #[test]
    fn finished_queue_with_in_flight_row_is_critical() {
        let row = row(CertificationStatus::Queued);
        let qj = queue_job(JobState::Completed, true, None);
        let issue = compare(&row, Some(&qj)).unwrap();
        assert_eq!(issue.kind, IssueKind::CriticalDesync);
    }

    #[test]
    fn terminal_rows_disagreeing_on_passed_mismatch() {
        let mut r = row(CertificationStatus::Certified);
        r.passed = Some(true);
        r.score = Some(92.0);
        let qj = queue_job(
            JobState::Completed,
            true,
            Some(serde_json::json!({"passed": false, "score": 92.0})),
        );
        let issue = compare(&r, Some(&qj)).unwrap();
        assert_eq!(issue.kind, IssueKind::FieldMismatch);
        assert!(issue.detail.contains("passed"));
    }

    #[test]
    fn terminal_rows_disagreeing_on_score_mismatch() {
        let mut r = row(CertificationStatus::Certified);
        r.passed = Some(true);
        r.score = Some(70.0);
        let qj = queue_job(
            JobState::Completed,
            true,
            Some(serde_json::json!({"passed": true, "score": 90.0})),
        );
        let issue = compare(&r, Some(&qj)).unwrap();
        assert_eq!(issue.kind, IssueKind::FieldMismatch);
        assert!(issue.detail.contains("score"));
    }

    #[test]
    fn evicted_queue_job_with_in_flight_row_is_orphaned() {
        let r = row(CertificationStatus::Processing);
        let issue = compare(&r, None).unwrap();
        assert_eq!(issue.kind, IssueKind::OrphanedReference);
    }

    #[test]
    fn evicted_queue_job_with_terminal_row_is_fine() {
        let mut r = row(CertificationStatus::Certified);
        r.passed = Some(true);
        assert!(compare(&r, None).is_none());
    }

    #[test]
    fn consistent_pair_reports_nothing() {
        let mut r = row(CertificationStatus::Certified);
        r.passed = Some(true);
        r.score = Some(88.5);
        let qj = queue_job(
            JobState::Completed,
            true,
            Some(serde_json::json!({"passed": true, "score": 88.5})),
        );
        assert!(compare(&r, Some(&qj)).is_none());
    }

    #[test]
    fn in_flight_pair_reports_nothing() {
        let r = row(CertificationStatus::Processing);
        let qj = queue_job(JobState::Active, false, None);
        assert!(compare(&r, Some(&qj)).is_none());
    }

    #[test]
    fn terminal_row_without_queue_ref_is_skipped() {
        let mut r = row(CertificationStatus::Failed);
        r.queue_job_id = None;
        assert!(compare(&r, None).is_none());
    }

    #[test]
    fn in_flight_row_without_queue_ref_is_orphaned() {
        let mut r = row(CertificationStatus::Queued);
        r.queue_job_id = None;
        let issue = compare(&r, None).unwrap();
        assert_eq!(issue.kind, IssueKind::OrphanedReference);
        assert!(issue.queue_job_id.is_none());
        assert!(issue.detail.contains("no queue job"));
    }

    #[test]
    fn report_groups_by_kind() {
        let in_flight = row(CertificationStatus::Queued);
        let qj = queue_job(JobState::Completed, true, None);
        let desync = compare(&in_flight, Some(&qj)).unwrap();

        let orphan_row = row(CertificationStatus::Processing);
        let orphan = compare(&orphan_row, None).unwrap();

        let report = ReconcileReport::new(5, vec![desync, orphan]);
        assert_eq!(report.scanned, 5);
        assert_eq!(report.counts.critical_desyncs, 1);
        assert_eq!(report.counts.orphaned_references, 1);
        assert_eq!(report.counts.field_mismatches, 0);
        assert!(!report.is_clean());
    }
}
