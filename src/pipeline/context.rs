use super::destinations::Destinations;
use crate::domain::WorkKind;
use crate::fetch::WorkerFactory;
use crate::gate::{JobGate, JobStatusSource};
use crate::metadata::MetadataStore;
use crate::pool::WorkerPool;
use crate::runtime::config::HarvesterConfig;
use crate::runtime::telemetry::Telemetry;
use crate::search::{AdaptiveSearch, RetryPolicy};
use std::sync::Arc;

/// Everything one pipeline instance shares across its in-flight work items.
///
/// Built once per consumer and handed to every handler, so several
/// independent pipelines can live in one process.
#[derive(Clone)]
pub struct HarvestContext {
    kind: WorkKind,
    destinations: Destinations,
    pool: WorkerPool,
    search: AdaptiveSearch,
    gate: JobGate,
    metadata: Arc<MetadataStore>,
    telemetry: Arc<Telemetry>,
    retry: RetryPolicy,
    max_in_flight: usize,
}

impl HarvestContext {
    pub fn new(
        config: &HarvesterConfig,
        factory: Arc<dyn WorkerFactory>,
        jobs: Arc<dyn JobStatusSource>,
    ) -> Self {
        let telemetry = Arc::new(Telemetry::default());
        let pool = WorkerPool::new(config.pool_config(), factory, telemetry.clone());
        let search = AdaptiveSearch::new(
            Arc::new(pool.clone()),
            config.search_options().clone(),
            config.refine_params(),
            telemetry.clone(),
        );
        let gate = JobGate::new(jobs, telemetry.clone());

        Self {
            kind: config.kind(),
            destinations: config.destinations().clone(),
            pool,
            search,
            gate,
            metadata: Arc::new(MetadataStore::new()),
            telemetry,
            retry: config.retry_policy(),
            max_in_flight: config.max_in_flight(),
        }
    }

    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn search(&self) -> &AdaptiveSearch {
        &self.search
    }

    pub fn gate(&self) -> &JobGate {
        &self.gate
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}
