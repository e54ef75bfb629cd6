pub mod config;
pub mod errors;
pub mod merge;
pub mod metrics;
pub mod poll;
pub mod rac_status;
pub mod status;
pub mod telemetry;
