pub mod config;
pub mod metrics;
pub mod routes;
pub mod store;
pub mod telemetry;
