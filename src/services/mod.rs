pub mod certification;
pub mod error_category;
pub mod progress;
pub mod provider;
pub mod queue;
pub mod reconcile;
pub mod worker;
