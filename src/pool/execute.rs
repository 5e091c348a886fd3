use super::worker_pool::{PoolError, WorkerPool};
use crate::fetch::{FetchError, FetchRequest, FetchResponse};
use async_trait::async_trait;
use std::fmt;

/// Why a single pooled fetch produced no response.
#[derive(Debug)]
pub enum ExecuteError {
    Pool(PoolError),
    Fetch(FetchError),
}

impl ExecuteError {
    /// Worth another attempt on a fresh worker.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecuteError::Pool(PoolError::Closed) => false,
            ExecuteError::Pool(PoolError::WorkerInit { .. }) => true,
            ExecuteError::Fetch(err) => err.is_transient(),
        }
    }

    pub fn is_pool_closed(&self) -> bool {
        matches!(self, ExecuteError::Pool(PoolError::Closed))
    }
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::Pool(err) => err.fmt(f),
            ExecuteError::Fetch(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ExecuteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecuteError::Pool(err) => Some(err),
            ExecuteError::Fetch(err) => Some(err),
        }
    }
}

impl From<PoolError> for ExecuteError {
    fn from(err: PoolError) -> Self {
        ExecuteError::Pool(err)
    }
}

impl From<FetchError> for ExecuteError {
    fn from(err: FetchError) -> Self {
        ExecuteError::Fetch(err)
    }
}

/// Runs one logical fetch on some worker.
#[async_trait]
pub trait FetchExecutor: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ExecuteError>;
}

#[async_trait]
impl FetchExecutor for WorkerPool {
    /// Borrows a worker for exactly one call. A worker whose call failed is
    /// destroyed instead of being returned, so the next attempt gets a fresh one.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ExecuteError> {
        let lease = self.acquire().await?;
        match lease.execute(request).await {
            Ok(response) => {
                lease.release();
                Ok(response)
            }
            Err(err) => {
                tracing::debug!(
                    worker = lease.id(),
                    request = request.kind.as_str(),
                    error = %err,
                    "fetch failed; discarding worker"
                );
                lease.discard().await;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VehicleTarget;
    use crate::pool::testing::StubFactory;
    use crate::pool::PoolConfig;
    use crate::runtime::telemetry::Telemetry;
    use std::sync::Arc;
    use std::time::Duration;

    fn target() -> VehicleTarget {
        VehicleTarget {
            vehicle_id: "7".into(),
            start_date: None,
            end_date: None,
            start_time: None,
            end_time: None,
            country: None,
        }
    }

    fn pool(factory: Arc<StubFactory>) -> WorkerPool {
        WorkerPool::new(
            PoolConfig {
                max_pool_size: 2,
                idle_timeout: Duration::from_secs(60),
                init_attempts: 1,
                init_backoff: Duration::ZERO,
            },
            factory,
            Arc::new(Telemetry::default()),
        )
    }

    #[tokio::test]
    async fn failed_fetch_replaces_worker() {
        let factory = Arc::new(StubFactory::with_responder(|_| {
            Err(FetchError::Network("reset".into()))
        }));
        let pool = pool(factory.clone());

        let err = pool.fetch(&FetchRequest::detail(&target())).await.unwrap_err();
        assert!(err.is_retryable());
        let first = factory.worker(1).unwrap();
        assert_eq!(first.destroy_calls(), 1);
        assert_eq!(pool.stats().members, 0);

        let _ = pool.fetch(&FetchRequest::detail(&target())).await;
        assert_eq!(factory.built(), 2);
    }

    #[tokio::test]
    async fn successful_fetch_returns_worker() {
        let factory = Arc::new(StubFactory::default());
        let pool = pool(factory.clone());
        pool.fetch(&FetchRequest::detail(&target())).await.unwrap();
        pool.fetch(&FetchRequest::detail(&target())).await.unwrap();
        assert_eq!(factory.built(), 1);
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn closed_pool_is_not_retryable() {
        let pool = pool(Arc::new(StubFactory::default()));
        pool.close().await;
        let err = pool.fetch(&FetchRequest::detail(&target())).await.unwrap_err();
        assert!(err.is_pool_closed());
        assert!(!err.is_retryable());
    }
}
