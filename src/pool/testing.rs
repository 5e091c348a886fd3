//! Scripted in-process workers for unit tests.

use crate::fetch::{FetchError, FetchRequest, FetchResponse, FetchWorker, WorkerFactory, WorkerId};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) type Responder =
    Arc<dyn Fn(&FetchRequest) -> Result<FetchResponse, FetchError> + Send + Sync>;

pub(crate) struct StubWorker {
    id: WorkerId,
    responder: Responder,
    fail_init: bool,
    running: AtomicBool,
    executions: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl StubWorker {
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchWorker for StubWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn init(&self) -> Result<()> {
        if self.fail_init {
            return Err(anyhow!("stub worker {} refused to start", self.id));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(FetchError::WorkerClosed);
        }
        self.executions.fetch_add(1, Ordering::SeqCst);
        (self.responder)(request)
    }

    async fn destroy(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub(crate) struct StubFactory {
    responder: Responder,
    failing_inits: AtomicUsize,
    built: Mutex<HashMap<WorkerId, Arc<StubWorker>>>,
}

impl Default for StubFactory {
    fn default() -> Self {
        Self::with_responder(|_| {
            Ok(FetchResponse {
                status: 200,
                body: json!({"vehicles": []}),
                bytes: 16,
            })
        })
    }
}

impl StubFactory {
    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&FetchRequest) -> Result<FetchResponse, FetchError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            failing_inits: AtomicUsize::new(0),
            built: Mutex::new(HashMap::new()),
        }
    }

    /// The next `count` workers fail `init`.
    pub(crate) fn fail_next_inits(&self, count: usize) {
        self.failing_inits.store(count, Ordering::SeqCst);
    }

    pub(crate) fn built(&self) -> usize {
        self.built.lock().unwrap().len()
    }

    pub(crate) fn worker(&self, id: WorkerId) -> Option<Arc<StubWorker>> {
        self.built.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn total_executions(&self) -> usize {
        self.built
            .lock()
            .unwrap()
            .values()
            .map(|worker| worker.executions())
            .sum()
    }

    pub(crate) fn all_failed_workers_destroyed(&self) -> bool {
        self.built
            .lock()
            .unwrap()
            .values()
            .filter(|worker| worker.fail_init)
            .all(|worker| worker.destroy_calls() > 0)
    }
}

impl WorkerFactory for StubFactory {
    fn build(&self, id: WorkerId) -> Result<Arc<dyn FetchWorker>> {
        let fail_init = self
            .failing_inits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let worker = Arc::new(StubWorker {
            id,
            responder: self.responder.clone(),
            fail_init,
            running: AtomicBool::new(false),
            executions: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        });
        self.built.lock().unwrap().insert(id, worker.clone());
        Ok(worker)
    }
}
