pub mod certify;
pub mod health;
pub mod metrics;
