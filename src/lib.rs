pub mod api;
pub mod config;
pub mod model;
pub mod session;
pub mod sync;
pub mod telemetry;
