//! Redis-backed named job queues with bounded worker concurrency.
//!
//! Per queue, Redis holds: a waiting list, an active list, a delayed zset
//! (score = promotion time in epoch ms), completed/failed id sets, and one
//! metadata hash per job (state, payload, attempts, return value). The
//! metadata is operational state only — the durable store remains the
//! single source of truth for certification outcomes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::Semaphore;

const POLL_INTERVAL_MS: u64 = 500;

/// Per-queue configuration registered before use.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Maximum handler invocations in flight at once.
    pub concurrency: usize,
    /// Total attempt budget per job (first run included).
    pub attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff_delay_ms: u64,
}

/// A job as handed to a registered handler.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub id: String,
    pub payload: serde_json::Value,
    /// Completed attempts before this one.
    pub attempts_made: u32,
}

/// Handler failure. `no_retry` consumes the remaining attempt budget
/// immediately, dead-lettering the job.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub no_retry: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), no_retry: false }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), no_retry: true }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

/// Queue-side view of a single job.
#[derive(Debug, Clone, Serialize)]
pub struct QueueJobStatus {
    pub state: JobState,
    pub returnvalue: Option<serde_json::Value>,
    pub attempts_made: u32,
    pub finished_on: Option<i64>,
    pub last_error: Option<String>,
}

/// Counts per state for one queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("queue not registered: {0}")]
    UnknownQueue(String),
}

/// Redis-backed job queue service. Cheap to clone; clones share queue
/// registrations.
#[derive(Clone)]
pub struct QueueService {
    client: redis::Client,
    queues: Arc<Mutex<HashMap<String, QueueOptions>>>,
}

impl QueueService {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            queues: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Register a named queue with its concurrency and retry policy.
    pub fn register(&self, name: &str, options: QueueOptions) {
        self.queues
            .lock()
            .expect("queue registry poisoned")
            .insert(name.to_string(), options);
    }

    fn options(&self, name: &str) -> Result<QueueOptions, QueueError> {
        self.queues
            .lock()
            .expect("queue registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Enqueue a job under a caller-chosen id, so the id can be bound to
    /// durable state before the job becomes runnable. Fails with
    /// `QueueError::Unavailable` if Redis is unreachable.
    pub async fn add_job(
        &self,
        name: &str,
        id: &str,
        payload: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.options(name)?;
        let mut conn = self.conn().await?;

        conn.hset_multiple::<_, _, _, ()>(
            meta_key(name, id),
            &[
                ("state", JobState::Waiting.to_string()),
                ("payload", serde_json::to_string(&payload)?),
                ("attempts_made", "0".to_string()),
                ("created_on", now_ms().to_string()),
            ],
        )
        .await?;
        conn.lpush::<_, _, ()>(waiting_key(name), id).await?;

        Ok(())
    }

    /// Run the worker loop for a queue. At most `concurrency` handler
    /// invocations are in flight at once; excess jobs remain waiting.
    /// Runs until the surrounding task is dropped.
    pub async fn run<F, Fut>(&self, name: &str, handler: F) -> Result<(), QueueError>
    where
        F: Fn(QueueJob) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        let options = self.options(name)?;
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let name = name.to_string();

        loop {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");

            let job = match self.take_next_job(&name).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(queue = %name, error = %e, "failed to pull job, backing off");
                    tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                    continue;
                }
            };

            let service = self.clone();
            let handler = handler.clone();
            let queue_name = name.clone();
            let opts = options.clone();

            tokio::spawn(async move {
                let job_id = job.id.clone();
                let attempts_made = job.attempts_made;
                let outcome = handler(job).await;

                if let Err(e) = service
                    .settle_job(&queue_name, &job_id, attempts_made, outcome, &opts)
                    .await
                {
                    tracing::error!(
                        queue = %queue_name,
                        job_id = %job_id,
                        error = %e,
                        "failed to settle job in queue backend"
                    );
                }
                drop(permit);
            });
        }
    }

    /// Pop one waiting job id and mark it active.
    async fn take_next_job(&self, name: &str) -> Result<Option<QueueJob>, QueueError> {
        let mut conn = self.conn().await?;
        let id: Option<String> = conn
            .rpoplpush(waiting_key(name), active_key(name))
            .await?;

        let id = match id {
            Some(id) => id,
            None => return Ok(None),
        };

        let meta: HashMap<String, String> = conn.hgetall(meta_key(name, &id)).await?;
        let payload = meta
            .get("payload")
            .map(|p| serde_json::from_str(p))
            .transpose()?
            .unwrap_or(serde_json::Value::Null);
        let attempts_made = meta
            .get("attempts_made")
            .and_then(|a| a.parse().ok())
            .unwrap_or(0);

        conn.hset::<_, _, _, ()>(meta_key(name, &id), "state", JobState::Active.to_string())
            .await?;

        Ok(Some(QueueJob { id, payload, attempts_made }))
    }

    /// Record a handler outcome: complete, schedule a retry, or dead-letter.
    async fn settle_job(
        &self,
        name: &str,
        id: &str,
        attempts_made: u32,
        outcome: Result<serde_json::Value, HandlerError>,
        options: &QueueOptions,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let meta = meta_key(name, id);

        match outcome {
            Ok(returnvalue) => {
                conn.hset_multiple::<_, _, _, ()>(
                    &meta,
                    &[
                        ("state", JobState::Completed.to_string()),
                        ("returnvalue", serde_json::to_string(&returnvalue)?),
                        ("finished_on", now_ms().to_string()),
                    ],
                )
                .await?;
                conn.lrem::<_, _, ()>(active_key(name), 1, id).await?;
                conn.sadd::<_, _, ()>(completed_key(name), id).await?;
            }
            Err(e) => {
                let attempts_used = attempts_made + 1;
                conn.hset_multiple::<_, _, _, ()>(
                    &meta,
                    &[
                        ("attempts_made", attempts_used.to_string()),
                        ("last_error", e.message.clone()),
                    ],
                )
                .await?;
                conn.lrem::<_, _, ()>(active_key(name), 1, id).await?;

                if !e.no_retry && attempts_used < options.attempts {
                    let delay = backoff_delay_ms(options.backoff_delay_ms, attempts_made);
                    let due = now_ms() + delay as i64;
                    conn.hset::<_, _, _, ()>(&meta, "state", JobState::Delayed.to_string())
                        .await?;
                    conn.zadd::<_, _, _, ()>(delayed_key(name), id, due).await?;
                    tracing::info!(
                        queue = %name,
                        job_id = %id,
                        attempts_made = attempts_used,
                        delay_ms = delay,
                        "job scheduled for retry"
                    );
                } else {
                    // Dead-letter: kept until an operator cleans the queue.
                    conn.hset_multiple::<_, _, _, ()>(
                        &meta,
                        &[
                            ("state", JobState::Failed.to_string()),
                            ("finished_on", now_ms().to_string()),
                        ],
                    )
                    .await?;
                    conn.sadd::<_, _, ()>(failed_key(name), id).await?;
                    tracing::warn!(
                        queue = %name,
                        job_id = %id,
                        attempts_made = attempts_used,
                        "job dead-lettered"
                    );
                }
            }
        }
        Ok(())
    }

    /// Move delayed jobs whose due time has passed back to waiting.
    /// Returns the number promoted.
    pub async fn promote_due_jobs(&self, name: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let due: Vec<String> = conn
            .zrangebyscore(delayed_key(name), 0, now_ms())
            .await?;

        let mut promoted = 0;
        for id in due {
            let removed: i64 = conn.zrem(delayed_key(name), &id).await?;
            if removed == 0 {
                // Another promoter won the race for this id.
                continue;
            }
            conn.hset::<_, _, _, ()>(
                meta_key(name, &id),
                "state",
                JobState::Waiting.to_string(),
            )
            .await?;
            conn.lpush::<_, _, ()>(waiting_key(name), &id).await?;
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Queue-side view of one job, or None if its metadata was evicted.
    pub async fn job_status(
        &self,
        name: &str,
        id: &str,
    ) -> Result<Option<QueueJobStatus>, QueueError> {
        let mut conn = self.conn().await?;
        let meta: HashMap<String, String> = conn.hgetall(meta_key(name, id)).await?;
        if meta.is_empty() {
            return Ok(None);
        }

        let state = meta
            .get("state")
            .and_then(|s| s.parse().ok())
            .unwrap_or(JobState::Waiting);
        let returnvalue = meta
            .get("returnvalue")
            .map(|v| serde_json::from_str(v))
            .transpose()?;
        let attempts_made = meta
            .get("attempts_made")
            .and_then(|a| a.parse().ok())
            .unwrap_or(0);
        let finished_on = meta.get("finished_on").and_then(|f| f.parse().ok());
        let last_error = meta.get("last_error").cloned();

        Ok(Some(QueueJobStatus {
            state,
            returnvalue,
            attempts_made,
            finished_on,
            last_error,
        }))
    }

    /// Current counts per state for a queue.
    pub async fn queue_counts(&self, name: &str) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn().await?;
        let waiting: u64 = conn.llen(waiting_key(name)).await?;
        let active: u64 = conn.llen(active_key(name)).await?;
        let completed: u64 = conn.scard(completed_key(name)).await?;
        let failed: u64 = conn.scard(failed_key(name)).await?;
        let delayed: u64 = conn.zcard(delayed_key(name)).await?;
        Ok(QueueCounts { waiting, active, completed, failed, delayed })
    }

    /// Purge metadata of terminal jobs older than the grace period.
    /// Operator-invoked only; nothing cleans dead-letters automatically.
    /// Returns the number of jobs purged.
    pub async fn clean_queue(&self, name: &str, grace_ms: i64) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let cutoff = now_ms() - grace_ms;
        let mut purged = 0;

        for set in [completed_key(name), failed_key(name)] {
            let ids: Vec<String> = conn.smembers(&set).await?;
            for id in ids {
                let finished_on: Option<i64> =
                    conn.hget(meta_key(name, &id), "finished_on").await?;
                if finished_on.is_some_and(|f| f < cutoff) {
                    conn.del::<_, ()>(meta_key(name, &id)).await?;
                    conn.srem::<_, _, ()>(&set, &id).await?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}

/// Exponential backoff: `base * 2^attempts_made`, saturating.
pub fn backoff_delay_ms(base_ms: u64, attempts_made: u32) -> u64 {
    base_ms.saturating_mul(1u64 << attempts_made.min(16))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn waiting_key(name: &str) -> String {
    format!("certify:{name}:waiting")
}

fn active_key(name: &str) -> String {
    format!("certify:{name}:active")
}

fn delayed_key(name: &str) -> String {
    format!("certify:{name}:delayed")
}

fn completed_key(name: &str) -> String {
    format!("certify:{name}:completed")
}

fn failed_key(name: &str) -> String {
    format!("certify:{name}:failed")
}

fn meta_key(name: &str, id: &str) -> String {
    format!("certify:{name}:job:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay_ms(5000, 0), 5000);
        assert_eq!(backoff_delay_ms(5000, 1), 10_000);
        assert_eq!(backoff_delay_ms(5000, 2), 20_000);
        assert_eq!(backoff_delay_ms(5000, 3), 40_000);
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff_delay_ms(u64::MAX, 5), u64::MAX);
        assert_eq!(backoff_delay_ms(1, 64), 1 << 16);
    }

    #[test]
    fn job_state_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Delayed,
        ] {
            let parsed: JobState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn handler_error_constructors() {
        assert!(!HandlerError::retryable("x").no_retry);
        assert!(HandlerError::permanent("x").no_retry);
    }
}
