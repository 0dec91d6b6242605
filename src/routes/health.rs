use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub queue: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub ok: bool,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn measure(ok: bool, started: Instant) -> Self {
        Self {
            ok,
            latency_ms: ok.then(|| started.elapsed().as_millis() as u64),
        }
    }
}

/// GET /health — durable store and queue backend reachability, with
/// per-dependency round-trip latency.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let database = ComponentHealth::measure(
        sqlx::query("SELECT 1").execute(&state.db).await.is_ok(),
        started,
    );

    let started = Instant::now();
    let queue = ComponentHealth::measure(state.queue.ping().await.is_ok(), started);

    let healthy = database.ok && queue.ok;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            checks: HealthChecks { database, queue },
        }),
    )
}
