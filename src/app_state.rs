use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    certification::CertificationService, progress::ProgressGateway, queue::QueueService,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<QueueService>,
    pub certification: Arc<CertificationService>,
    pub progress: Arc<ProgressGateway>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queue: Arc<QueueService>,
        certification: CertificationService,
        progress: Arc<ProgressGateway>,
    ) -> Self {
        Self {
            db,
            queue,
            certification: Arc::new(certification),
            progress,
        }
    }
}
