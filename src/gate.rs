//! Job gate: decides, per work item, whether its job still wants the work.

pub mod http;

pub use http::{HttpJobStatusClient, DEFAULT_GATE_TIMEOUT};

use crate::domain::JobStatus;
use crate::runtime::telemetry::Telemetry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// The status service could not be reached.
    Unreachable(String),
    /// The service answered with a non-success status.
    UnexpectedStatus { code: u16 },
    /// The service answered with something that is not a job state.
    UnknownState(String),
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::Unreachable(reason) => write!(f, "job status service unreachable: {reason}"),
            GateError::UnexpectedStatus { code } => {
                write!(f, "job status service answered with http {code}")
            }
            GateError::UnknownState(state) => write!(f, "unknown job state `{state}`"),
        }
    }
}

impl std::error::Error for GateError {}

/// Where job states come from.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn status(&self, job_id: &str) -> Result<JobStatus, GateError>;
}

/// What to do with a work item given its job's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// CREATED or RUNNING: process it.
    Proceed(JobStatus),
    /// CANCELLED: settle it without processing.
    Drop,
    /// STOPPED: leave it unsettled for redelivery.
    Defer,
    /// Lookup failed: leave it unsettled.
    Unknown(GateError),
}

impl GateDecision {
    pub fn from_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Created | JobStatus::Running => GateDecision::Proceed(status),
            JobStatus::Stopped => GateDecision::Defer,
            JobStatus::Cancelled => GateDecision::Drop,
        }
    }
}

#[derive(Clone)]
pub struct JobGate {
    source: Arc<dyn JobStatusSource>,
    telemetry: Arc<Telemetry>,
}

impl JobGate {
    pub fn new(source: Arc<dyn JobStatusSource>, telemetry: Arc<Telemetry>) -> Self {
        Self { source, telemetry }
    }

    pub async fn check(&self, job_id: &str) -> GateDecision {
        let decision = match self.source.status(job_id).await {
            Ok(status) => GateDecision::from_status(status),
            Err(err) => GateDecision::Unknown(err),
        };

        match &decision {
            GateDecision::Proceed(_) => {}
            GateDecision::Drop => {
                self.telemetry.record_gate_dropped();
                tracing::info!(job_id, "job cancelled; dropping work item");
            }
            GateDecision::Defer => {
                self.telemetry.record_gate_deferred();
                tracing::info!(job_id, "job stopped; leaving work item for redelivery");
            }
            GateDecision::Unknown(err) => {
                self.telemetry.record_gate_unknown();
                tracing::warn!(job_id, error = %err, "job status unknown; leaving work item unsettled");
            }
        }
        decision
    }
}

/// In-process job table, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryJobStatus {
    jobs: Mutex<HashMap<String, JobStatus>>,
}

impl MemoryJobStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, job_id: impl Into<String>, status: JobStatus) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.into(), status);
    }
}

#[async_trait]
impl JobStatusSource for MemoryJobStatus {
    async fn status(&self, job_id: &str) -> Result<JobStatus, GateError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .copied()
            .ok_or_else(|| GateError::UnknownState(format!("no job {job_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn maps_every_state() {
        let jobs = Arc::new(MemoryJobStatus::new());
        jobs.set("1", JobStatus::Running);
        jobs.set("2", JobStatus::Created);
        jobs.set("3", JobStatus::Stopped);
        jobs.set("4", JobStatus::Cancelled);
        let telemetry = Arc::new(Telemetry::default());
        let gate = JobGate::new(jobs, telemetry.clone());

        assert_eq!(gate.check("1").await, GateDecision::Proceed(JobStatus::Running));
        assert_eq!(gate.check("2").await, GateDecision::Proceed(JobStatus::Created));
        assert_eq!(gate.check("3").await, GateDecision::Defer);
        assert_eq!(gate.check("4").await, GateDecision::Drop);
        assert!(matches!(gate.check("5").await, GateDecision::Unknown(_)));

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.gate_dropped, 1);
        assert_eq!(snapshot.gate_deferred, 1);
        assert_eq!(snapshot.gate_unknown, 1);
    }
}
