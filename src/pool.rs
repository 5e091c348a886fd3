//! Bounded pool of fetch workers: lending, idle eviction, crash replacement,
//! and the backpressure signal consumed by the queue adapters.

pub mod activity;
pub mod execute;
pub mod lease;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod testing;

pub use activity::{ActivityGuard, ActivityTracker};
pub use execute::{ExecuteError, FetchExecutor};
pub use lease::WorkerLease;
pub use worker_pool::{PoolConfig, PoolError, PoolStats, WorkerPool};
