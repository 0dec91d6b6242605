pub mod api;
pub mod certification;
pub mod job;
