//! Model Certification Job Orchestrator
//!
//! This library provides the core functionality for certify-hub: the
//! pipeline that asynchronously tests AI model deployments across regions,
//! tracks job progress in PostgreSQL against an ephemeral Redis queue,
//! categorizes and retries failures, and streams live progress to clients.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
