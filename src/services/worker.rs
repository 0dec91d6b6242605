//! Certification worker: the handler registered with the queue service.
//!
//! Runs a fixed battery of test prompts against the provider adapter,
//! scores the deployment, persists the outcome with a version-guarded
//! write, and advances the parent job's counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::certification::{Badge, CertificationOutcome, CertificationStatus};
use crate::services::error_category::{categorize, CategorizedError};
use crate::services::progress::{CertificationSummary, ProgressEvent, ProgressGateway};
use crate::services::provider::{collect_stream, ChatMessage, ChatOptions, ProviderAdapter};
use crate::services::queue::{HandlerError, QueueJob};

/// Success rate at or above which a deployment is certified. Below it,
/// partial passes yield quality_warning instead of failed.
const QUALITY_PASS_THRESHOLD: f64 = 70.0;

const PROBE_MAX_TOKENS: u32 = 64;

/// Payload carried by each queue job.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificationTask {
    pub certification_id: Uuid,
    pub model_id: String,
    pub region: String,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeKind {
    Latency,
    Correctness,
    Streaming,
}

struct TestPrompt {
    name: &'static str,
    prompt: &'static str,
    kind: ProbeKind,
}

/// The fixed battery every certification runs.
const TEST_BATTERY: &[TestPrompt] = &[
    TestPrompt {
        name: "latency_probe",
        prompt: "Reply with the single word READY.",
        kind: ProbeKind::Latency,
    },
    TestPrompt {
        name: "correctness_marker",
        prompt: "Reply with exactly the word PONG and nothing else.",
        kind: ProbeKind::Correctness,
    },
    TestPrompt {
        name: "streaming_probe",
        prompt: "Count from one to five, one number per line.",
        kind: ProbeKind::Streaming,
    },
];

/// Raw battery results before scoring.
#[derive(Debug, Default, Clone)]
pub struct BatteryOutcome {
    pub tests_passed: i32,
    pub tests_failed: i32,
    pub latencies_ms: Vec<f64>,
    pub last_error: Option<String>,
    /// Adapter-level failure that aborted the battery early.
    pub hard_error: Option<String>,
}

impl BatteryOutcome {
    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            None
        } else {
            Some(self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64)
        }
    }
}

/// The worker registered with the queue service. Generic over the provider
/// so tests can script responses.
pub struct CertificationWorker<P> {
    db: PgPool,
    provider: Arc<P>,
    progress: Arc<ProgressGateway>,
    timeout: Duration,
    attempts: u32,
}

impl<P: ProviderAdapter + 'static> CertificationWorker<P> {
    pub fn new(
        db: PgPool,
        provider: Arc<P>,
        progress: Arc<ProgressGateway>,
        timeout: Duration,
        attempts: u32,
    ) -> Self {
        Self { db, provider, progress, timeout, attempts }
    }

    /// Process one queue job end to end.
    pub async fn handle(&self, job: QueueJob) -> Result<serde_json::Value, HandlerError> {
        let task: CertificationTask = serde_json::from_value(job.payload)
            .map_err(|e| HandlerError::permanent(format!("malformed job payload: {e}")))?;

        tracing::info!(
            certification_id = %task.certification_id,
            model_id = %task.model_id,
            region = %task.region,
            attempts_made = job.attempts_made,
            "processing certification"
        );

        let row = queries::get_certification(&self.db, task.certification_id)
            .await
            .map_err(db_err)?
            .ok_or_else(|| HandlerError::permanent("certification row missing"))?;

        if row.queue_job_id.as_deref().is_some_and(|qid| qid != job.id) {
            // The pair was re-queued under a newer queue job; the reset
            // already resolved this delivery's aggregate. Drop it.
            tracing::warn!(
                certification_id = %task.certification_id,
                delivery = %job.id,
                "dropping delivery superseded by a newer queue job"
            );
            return Ok(json!({ "superseded": true }));
        }

        if row.status.is_terminal() {
            // Duplicate delivery of an already-resolved certification.
            tracing::warn!(
                certification_id = %task.certification_id,
                status = %row.status,
                "skipping delivery for terminal certification"
            );
            return Ok(json!({ "duplicate": true, "status": row.status }));
        }

        let version = match queries::begin_processing(&self.db, task.certification_id, row.version)
            .await
            .map_err(db_err)?
        {
            Some(v) => v,
            None => {
                // Lost the version race: the row was reset or resolved by
                // someone newer than this delivery.
                tracing::warn!(
                    certification_id = %task.certification_id,
                    expected_version = row.version,
                    "stale delivery, version guard rejected processing"
                );
                return Ok(json!({ "stale": true }));
            }
        };

        queries::mark_job_processing(&self.db, task.job_id)
            .await
            .map_err(db_err)?;

        self.progress
            .publish(
                task.certification_id,
                ProgressEvent::message(format!(
                    "certifying {} in {}",
                    task.model_id, task.region
                )),
            )
            .await;

        let started = Instant::now();
        let options = ChatOptions {
            model_id: task.model_id.clone(),
            region: task.region.clone(),
            max_tokens: PROBE_MAX_TOKENS,
        };

        let outcome = match tokio::time::timeout(
            self.timeout,
            run_battery(
                self.provider.as_ref(),
                &self.progress,
                task.certification_id,
                &options,
            ),
        )
        .await
        {
            Ok(battery) => outcome_from_battery(&battery),
            Err(_) => timeout_outcome(self.timeout),
        };

        // Temporary failures with budget left ride the queue's backoff; the
        // row stays processing until the final attempt resolves it.
        if outcome.status == CertificationStatus::Failed {
            if let Some(error) = &outcome.error {
                if error.is_temporary && job.attempts_made + 1 < self.attempts {
                    queries::record_attempt_error(&self.db, task.certification_id, &error.message)
                        .await
                        .map_err(db_err)?;
                    self.progress
                        .publish(
                            task.certification_id,
                            ProgressEvent::Error { message: error.message.clone() },
                        )
                        .await;
                    tracing::info!(
                        certification_id = %task.certification_id,
                        category = %error.category,
                        "temporary failure, leaving retry to the queue"
                    );
                    return Err(HandlerError::retryable(error.message.clone()));
                }
            }
        }

        self.finalize(&task, version, &outcome, started.elapsed())
            .await
    }

    /// Terminal write plus parent-counter bookkeeping.
    async fn finalize(
        &self,
        task: &CertificationTask,
        version: i32,
        outcome: &CertificationOutcome,
        elapsed: Duration,
    ) -> Result<serde_json::Value, HandlerError> {
        let won = queries::finish_certification(&self.db, task.certification_id, version, outcome)
            .await
            .map_err(db_err)?;

        if !won {
            tracing::warn!(
                certification_id = %task.certification_id,
                "version guard rejected terminal write, dropping duplicate result"
            );
            return Ok(json!({ "stale": true }));
        }

        // Counters advance exactly once per certification because only the
        // winning CAS writer reaches this point.
        let success = outcome.status == CertificationStatus::Certified;
        let mut conn = self.db.acquire().await.map_err(db_err)?;
        if let Some((processed, total)) =
            queries::advance_job_progress(&mut conn, task.job_id, success)
                .await
                .map_err(db_err)?
        {
            if processed >= total && queries::complete_job_if_done(&mut conn, task.job_id)
                .await
                .map_err(db_err)?
            {
                tracing::info!(job_id = %task.job_id, total_models = total, "certification job completed");
            }
        }

        metrics::histogram!("certification_duration_seconds").record(elapsed.as_secs_f64());
        match outcome.status {
            CertificationStatus::Certified => {
                metrics::counter!("certifications_completed_total").increment(1)
            }
            _ => metrics::counter!("certifications_failed_total").increment(1),
        }

        self.progress
            .publish(
                task.certification_id,
                ProgressEvent::Complete { certification: summarize(task, outcome) },
            )
            .await;
        self.progress.close(task.certification_id);

        tracing::info!(
            certification_id = %task.certification_id,
            status = %outcome.status,
            score = outcome.score,
            badge = %outcome.badge,
            "certification resolved"
        );

        match outcome.status {
            CertificationStatus::Failed => {
                let message = outcome
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "certification failed".to_string());
                Err(HandlerError::permanent(message))
            }
            _ => Ok(json!({
                "certification_id": task.certification_id,
                "model_id": task.model_id,
                "region": task.region,
                "status": outcome.status,
                "passed": outcome.passed,
                "score": outcome.score,
            })),
        }
    }
}

/// Run the fixed prompt battery. An adapter-level error (not a per-prompt
/// failure) aborts the remaining probes and is reported as `hard_error`.
pub async fn run_battery<P: ProviderAdapter>(
    provider: &P,
    progress: &ProgressGateway,
    certification_id: Uuid,
    options: &ChatOptions,
) -> BatteryOutcome {
    let mut outcome = BatteryOutcome::default();
    let total = TEST_BATTERY.len() as u32;

    for (index, test) in TEST_BATTERY.iter().enumerate() {
        let current = index as u32 + 1;
        progress
            .publish(
                certification_id,
                ProgressEvent::test_progress(current, total, test.name, "running"),
            )
            .await;

        let started = Instant::now();
        let stream = match provider
            .stream_chat(vec![ChatMessage::user(test.prompt)], options)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                outcome.hard_error = Some(e.to_string());
                progress
                    .publish(
                        certification_id,
                        ProgressEvent::test_progress(current, total, test.name, "aborted"),
                    )
                    .await;
                return outcome;
            }
        };

        let (content, chunks, error) = collect_stream(stream).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let passed = error.is_none() && probe_passed(test.kind, &content, chunks);
        if passed {
            outcome.tests_passed += 1;
            outcome.latencies_ms.push(latency_ms);
        } else {
            outcome.tests_failed += 1;
            outcome.last_error = error.or_else(|| {
                Some(format!("probe {} got unexpected response", test.name))
            });
        }

        progress
            .publish(
                certification_id,
                ProgressEvent::test_progress(
                    current,
                    total,
                    test.name,
                    if passed { "passed" } else { "failed" },
                ),
            )
            .await;
    }

    outcome
}

fn probe_passed(kind: ProbeKind, content: &str, chunks: u32) -> bool {
    match kind {
        ProbeKind::Latency => !content.trim().is_empty(),
        ProbeKind::Correctness => content.to_uppercase().contains("PONG"),
        ProbeKind::Streaming => chunks >= 1 && !content.trim().is_empty(),
    }
}

/// Percentage of battery prompts that passed.
pub fn success_rate(passed: i32, failed: i32) -> f64 {
    let total = passed + failed;
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64 * 100.0
    }
}

/// Latency contribution to the score: 100 at ≤1s mean, 0 at ≥10s.
pub fn latency_component(avg_latency_ms: f64) -> f64 {
    if avg_latency_ms <= 1_000.0 {
        100.0
    } else if avg_latency_ms >= 10_000.0 {
        0.0
    } else {
        100.0 * (10_000.0 - avg_latency_ms) / 9_000.0
    }
}

/// Overall score: weighted success rate and latency.
pub fn compute_score(success_rate: f64, avg_latency_ms: Option<f64>) -> f64 {
    match avg_latency_ms {
        Some(avg) => 0.8 * success_rate + 0.2 * latency_component(avg),
        None => 0.8 * success_rate,
    }
}

pub fn badge_for_score(score: f64) -> Badge {
    if score >= 95.0 {
        Badge::Platinum
    } else if score >= 85.0 {
        Badge::Gold
    } else if score >= 70.0 {
        Badge::Silver
    } else {
        Badge::None
    }
}

pub fn rating_for_badge(badge: Badge) -> &'static str {
    match badge {
        Badge::Platinum => "excellent",
        Badge::Gold => "good",
        Badge::Silver => "fair",
        Badge::None => "poor",
    }
}

/// Score the battery and decide the terminal status.
pub fn outcome_from_battery(battery: &BatteryOutcome) -> CertificationOutcome {
    let rate = success_rate(battery.tests_passed, battery.tests_failed);
    let avg = battery.avg_latency_ms();

    if let Some(hard) = &battery.hard_error {
        return failure_outcome(battery, rate, avg, categorize(hard));
    }

    let score = compute_score(rate, avg);

    if rate >= QUALITY_PASS_THRESHOLD {
        let badge = badge_for_score(score);
        return CertificationOutcome {
            status: CertificationStatus::Certified,
            passed: true,
            score,
            rating: rating_for_badge(badge).to_string(),
            badge,
            tests_passed: battery.tests_passed,
            tests_failed: battery.tests_failed,
            success_rate: rate,
            avg_latency_ms: avg,
            error: None,
        };
    }

    if battery.tests_passed > 0 {
        // Reachable but below the quality floor.
        return CertificationOutcome {
            status: CertificationStatus::QualityWarning,
            passed: false,
            score,
            rating: rating_for_badge(Badge::None).to_string(),
            badge: Badge::None,
            tests_passed: battery.tests_passed,
            tests_failed: battery.tests_failed,
            success_rate: rate,
            avg_latency_ms: avg,
            error: battery.last_error.as_deref().map(categorize),
        };
    }

    let raw = battery
        .last_error
        .clone()
        .unwrap_or_else(|| "all battery prompts failed".to_string());
    failure_outcome(battery, rate, avg, categorize(&raw))
}

fn failure_outcome(
    battery: &BatteryOutcome,
    rate: f64,
    avg: Option<f64>,
    error: CategorizedError,
) -> CertificationOutcome {
    CertificationOutcome {
        status: CertificationStatus::Failed,
        passed: false,
        score: 0.0,
        rating: rating_for_badge(Badge::None).to_string(),
        badge: Badge::None,
        tests_passed: battery.tests_passed,
        tests_failed: battery.tests_failed,
        success_rate: rate,
        avg_latency_ms: avg,
        error: Some(error),
    }
}

/// Outcome for a battery that exceeded the wall-clock limit. The battery
/// future was dropped, so no partial counts survive.
pub fn timeout_outcome(timeout: Duration) -> CertificationOutcome {
    let raw = format!(
        "certification timed out after {}s wall clock",
        timeout.as_secs()
    );
    failure_outcome(&BatteryOutcome::default(), 0.0, None, categorize(&raw))
}

fn summarize(task: &CertificationTask, outcome: &CertificationOutcome) -> CertificationSummary {
    CertificationSummary {
        model_id: task.model_id.clone(),
        status: outcome.status.to_string(),
        is_certified: outcome.status == CertificationStatus::Certified,
        is_available: outcome.status != CertificationStatus::Failed,
        tests_passed: outcome.tests_passed,
        tests_failed: outcome.tests_failed,
        success_rate: outcome.success_rate,
        avg_latency_ms: outcome.avg_latency_ms,
        categorized_error: outcome.error.clone(),
    }
}

fn db_err(e: sqlx::Error) -> HandlerError {
    // Durable-store hiccups bubble to the queue's retry mechanism.
    HandlerError::retryable(format!("database error: {e}"))
}
