//! Progress gateway: relays worker-emitted events to long-lived client
//! connections. The worker and the API server are separate processes, so
//! events travel over a Redis pub/sub channel per certification; each
//! process keeps a broadcast registry as its local fan-out. Dropping a
//! client connection only stops consumption, it never reaches into the
//! worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::services::error_category::CategorizedError;

const CHANNEL_CAPACITY: usize = 64;

/// How often an idle relay checks whether all its subscribers are gone.
const RELAY_IDLE_CHECK: Duration = Duration::from_secs(30);

/// Terminal summary pushed with the `complete` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificationSummary {
    pub model_id: String,
    pub status: String,
    pub is_certified: bool,
    pub is_available: bool,
    pub tests_passed: i32,
    pub tests_failed: i32,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categorized_error: Option<CategorizedError>,
}

/// Event contract for the progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress {
        #[serde(skip_serializing_if = "Option::is_none")]
        current: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u32>,
        #[serde(rename = "testName", skip_serializing_if = "Option::is_none")]
        test_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Complete {
        certification: CertificationSummary,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn test_progress(current: u32, total: u32, test_name: &str, status: &str) -> Self {
        ProgressEvent::Progress {
            current: Some(current),
            total: Some(total),
            test_name: Some(test_name.to_string()),
            status: Some(status.to_string()),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        ProgressEvent::Progress {
            current: None,
            total: None,
            test_name: None,
            status: None,
            message: Some(message.into()),
        }
    }
}

struct Channel {
    sender: broadcast::Sender<ProgressEvent>,
    relay: Option<tokio::task::AbortHandle>,
}

type ChannelRegistry = Arc<Mutex<HashMap<Uuid, Channel>>>;

/// Per-process registry of broadcast channels, bridged across processes by
/// Redis pub/sub. Publishers (the worker) push through Redis; subscribers
/// (the SSE route) get a relay task forwarding the Redis channel into
/// their local broadcast channel.
pub struct ProgressGateway {
    redis: redis::Client,
    channels: ChannelRegistry,
}

impl ProgressGateway {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            redis: redis::Client::open(redis_url)?,
            channels: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Subscribe to events for one certification. The first subscriber
    /// starts the pub/sub relay and waits until it is listening, so events
    /// published right after this call are not missed.
    pub async fn subscribe(&self, certification_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        let (receiver, ready) = {
            let mut channels = self.channels.lock().expect("progress registry poisoned");
            let entry = channels.entry(certification_id).or_insert_with(|| Channel {
                sender: broadcast::channel(CHANNEL_CAPACITY).0,
                relay: None,
            });
            let receiver = entry.sender.subscribe();
            let ready = if entry.relay.is_none() {
                let (ready_tx, ready_rx) = oneshot::channel();
                let task = tokio::spawn(relay(
                    self.redis.clone(),
                    certification_id,
                    entry.sender.clone(),
                    self.channels.clone(),
                    ready_tx,
                ));
                entry.relay = Some(task.abort_handle());
                Some(ready_rx)
            } else {
                None
            };
            (receiver, ready)
        };

        if let Some(ready) = ready {
            // A relay that failed to connect still resolves; local
            // publishes keep working without it.
            let _ = ready.await;
        }
        receiver
    }

    /// Publish an event. Delivery goes through Redis so it reaches
    /// subscribers in other processes; if Redis is unreachable the event
    /// falls back to same-process subscribers. Push-only signalling,
    /// never state of record.
    pub async fn publish(&self, certification_id: Uuid, event: ProgressEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize progress event");
                return;
            }
        };

        match self.redis.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                let published: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
                    .arg(channel_name(certification_id))
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = published {
                    tracing::warn!(error = %e, "progress publish failed, delivering locally only");
                    self.publish_local(certification_id, event);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "progress relay unreachable, delivering locally only");
                self.publish_local(certification_id, event);
            }
        }
    }

    fn publish_local(&self, certification_id: Uuid, event: ProgressEvent) {
        let sender = {
            let channels = self.channels.lock().expect("progress registry poisoned");
            channels.get(&certification_id).map(|c| c.sender.clone())
        };
        if let Some(sender) = sender {
            // Send fails only when there are no receivers, which is fine.
            let _ = sender.send(event);
        }
    }

    /// Drop the channel and its relay for one certification.
    pub fn close(&self, certification_id: Uuid) {
        let removed = self
            .channels
            .lock()
            .expect("progress registry poisoned")
            .remove(&certification_id);
        if let Some(channel) = removed {
            if let Some(relay) = channel.relay {
                relay.abort();
            }
        }
    }
}

/// Forward one certification's Redis channel into the local broadcast
/// channel. Exits, removing its registry entry, when the terminal event
/// passes through, when every subscriber is gone, or when the pub/sub
/// connection drops.
async fn relay(
    client: redis::Client,
    certification_id: Uuid,
    sender: broadcast::Sender<ProgressEvent>,
    channels: ChannelRegistry,
    ready: oneshot::Sender<()>,
) {
    let mut pubsub = match client.get_async_pubsub().await {
        Ok(pubsub) => pubsub,
        Err(e) => {
            tracing::warn!(
                certification_id = %certification_id,
                error = %e,
                "progress relay could not connect, local events only"
            );
            let _ = ready.send(());
            return;
        }
    };
    if let Err(e) = pubsub.subscribe(channel_name(certification_id)).await {
        tracing::warn!(certification_id = %certification_id, error = %e, "progress relay subscribe failed");
        let _ = ready.send(());
        return;
    }
    let _ = ready.send(());

    let mut messages = pubsub.on_message();
    loop {
        match tokio::time::timeout(RELAY_IDLE_CHECK, messages.next()).await {
            Ok(Some(msg)) => {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<ProgressEvent>(&payload) else {
                    tracing::warn!(certification_id = %certification_id, "dropping malformed progress payload");
                    continue;
                };
                let terminal = matches!(event, ProgressEvent::Complete { .. });
                if sender.send(event).is_err() || terminal {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                // Idle with no subscribers left: nothing to forward to.
                if sender.receiver_count() == 0 {
                    break;
                }
            }
        }
    }

    channels
        .lock()
        .expect("progress registry poisoned")
        .remove(&certification_id);
}

fn channel_name(certification_id: Uuid) -> String {
    format!("certify:progress:{certification_id}")
}
