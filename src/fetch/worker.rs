use super::error::FetchError;
use super::request::FetchRequest;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub type WorkerId = u64;

/// Structured result of one successful `execute`.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Value,
    /// Bytes received for this call.
    pub bytes: usize,
}

/// A single long-lived session bound to one proxy egress.
///
/// Implementations must make `destroy` idempotent and must fail every
/// `execute` issued after `destroy` has started with
/// [`FetchError::WorkerClosed`].
#[async_trait]
pub trait FetchWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// Establishes the session: proxy credentials, payload governor, and a
    /// warm-up navigation to the marketplace origin.
    async fn init(&self) -> Result<()>;

    async fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;

    async fn destroy(&self);

    fn is_running(&self) -> bool;
}

/// Builds uninitialised workers for the pool.
pub trait WorkerFactory: Send + Sync {
    fn build(&self, id: WorkerId) -> Result<Arc<dyn FetchWorker>>;
}
