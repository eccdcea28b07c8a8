pub mod archive;
pub mod archive_fs;
pub mod archive_object;
pub mod archive_postgres;
pub mod bots;
pub mod cache;
pub mod cache_redis;
pub mod canvas;
pub mod config;
pub mod log_throttle;
pub mod metrics;
pub mod mirror;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod telemetry;
