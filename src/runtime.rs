//! Runtime glue that wires configuration, retry backoff, telemetry, and
//! runner orchestration.

pub mod backoff;
pub mod config;
pub mod runner;
pub mod telemetry;
