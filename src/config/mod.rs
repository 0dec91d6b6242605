use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for job queue
    pub redis_url: String,

    /// Maximum PostgreSQL pool connections per process
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Base URL of the model gateway (provider adapter)
    pub provider_base_url: String,

    /// API token for the model gateway
    pub provider_api_token: String,

    /// Parallel certifications in flight per worker process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Total attempt budget per certification job
    #[serde(default = "default_job_attempts")]
    pub job_attempts: u32,

    /// Base retry backoff in milliseconds (doubles per attempt)
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,

    /// Wall-clock limit for one certification in seconds
    #[serde(default = "default_certification_timeout_secs")]
    pub certification_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_worker_concurrency() -> usize {
    3
}

fn default_job_attempts() -> u32 {
    3
}

fn default_backoff_delay_ms() -> u64 {
    5000
}

fn default_certification_timeout_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
