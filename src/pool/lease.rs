use super::activity::ActivityGuard;
use super::worker_pool::PoolInner;
use crate::fetch::{FetchError, FetchRequest, FetchResponse, FetchWorker, WorkerId};
use std::fmt;
use std::sync::Arc;

/// Exclusive loan of one pool member.
///
/// A lease must end with [`release`](WorkerLease::release) (worker goes back
/// to the idle set) or [`discard`](WorkerLease::discard) (worker is destroyed
/// and its slot freed). Dropping an unsettled lease releases it.
pub struct WorkerLease {
    worker: Arc<dyn FetchWorker>,
    pool: Arc<PoolInner>,
    settled: bool,
    _activity: ActivityGuard,
}

impl WorkerLease {
    pub(super) fn new(worker: Arc<dyn FetchWorker>, pool: Arc<PoolInner>) -> Self {
        let activity = pool.activity.enter();
        Self {
            worker,
            pool,
            settled: false,
            _activity: activity,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.worker.id()
    }

    pub fn worker(&self) -> &Arc<dyn FetchWorker> {
        &self.worker
    }

    pub async fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let result = self.worker.execute(request).await;
        match &result {
            Ok(response) => self.pool.telemetry.record_fetch(response.bytes),
            Err(_) => self.pool.telemetry.record_fetch_error(),
        }
        result
    }

    pub fn release(mut self) {
        self.settled = true;
        self.pool.release_worker(&self.worker);
    }

    pub async fn discard(mut self) {
        self.settled = true;
        self.pool.discard_worker(self.worker.clone()).await;
    }
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.worker.id())
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.release_worker(&self.worker);
        }
    }
}
