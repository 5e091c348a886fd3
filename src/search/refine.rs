//! Density-driven quadtree refinement of a search cell.
//!
//! A cell is fetched once; if its page is full (and the area can still
//! shrink, and the depth bound allows) it is split into `divider x divider`
//! children which are refined in turn, depth-first. Each finished cell becomes
//! a [`Leaf`], accepted or failed.

use super::retry::{fetch_with_retry, RetryPolicy};
use crate::domain::{Cell, CellError};
use crate::fetch::{FetchRequest, FetchResponse, SearchOptions, SearchPage};
use crate::pool::{ExecuteError, FetchExecutor};
use crate::runtime::backoff::jittered;
use crate::runtime::telemetry::Telemetry;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_THRESHOLD: usize = 200;
pub const DEFAULT_DIVIDER: usize = 2;
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 10;
pub const DEFAULT_SPLIT_DELAY_MIN: Duration = Duration::from_millis(500);
pub const DEFAULT_SPLIT_DELAY_MAX: Duration = Duration::from_millis(1100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefineParams {
    /// A page with at least this many listings triggers a split.
    pub threshold: usize,
    pub divider: usize,
    /// Cells deeper than this are accepted whatever their count.
    pub max_depth: usize,
    pub retry: RetryPolicy,
    pub split_delay_min: Duration,
    pub split_delay_max: Duration,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            divider: DEFAULT_DIVIDER,
            max_depth: DEFAULT_MAX_RECURSION_DEPTH,
            retry: RetryPolicy::default(),
            split_delay_min: DEFAULT_SPLIT_DELAY_MIN,
            split_delay_max: DEFAULT_SPLIT_DELAY_MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeafOutcome {
    Accepted { vehicle_count: usize, response: Value },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    /// The cell with its count, status, and date already recorded.
    pub cell: Cell,
    pub depth: usize,
    pub outcome: LeafOutcome,
}

impl Leaf {
    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome, LeafOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefineReport {
    /// Leaves in depth-first order.
    pub leaves: Vec<Leaf>,
    /// Fetch attempts, retries included.
    pub fetches: usize,
    pub splits: usize,
}

impl RefineReport {
    pub fn accepted(&self) -> impl Iterator<Item = &Leaf> {
        self.leaves.iter().filter(|leaf| leaf.is_accepted())
    }

    pub fn failed(&self) -> impl Iterator<Item = &Leaf> {
        self.leaves.iter().filter(|leaf| !leaf.is_accepted())
    }
}

#[derive(Debug)]
pub enum RefineError {
    /// The pool closed mid-refinement; the work item must not be settled.
    PoolClosed,
    Split(CellError),
}

impl fmt::Display for RefineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefineError::PoolClosed => write!(f, "worker pool closed during refinement"),
            RefineError::Split(err) => write!(f, "failed to split cell: {err}"),
        }
    }
}

impl std::error::Error for RefineError {}

/// Refinement bound to one executor and one set of run-wide search options.
#[derive(Clone)]
pub struct AdaptiveSearch {
    executor: Arc<dyn FetchExecutor>,
    options: SearchOptions,
    params: RefineParams,
    telemetry: Arc<Telemetry>,
}

impl AdaptiveSearch {
    pub fn new(
        executor: Arc<dyn FetchExecutor>,
        options: SearchOptions,
        params: RefineParams,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            executor,
            options,
            params,
            telemetry,
        }
    }

    pub fn params(&self) -> &RefineParams {
        &self.params
    }

    pub async fn refine(&self, cell: Cell) -> Result<RefineReport, RefineError> {
        let today = Utc::now().date_naive();
        let mut report = RefineReport::default();
        // Children are pushed in reverse so they pop in split order.
        let mut pending = vec![(cell, 0usize)];

        while let Some((cell, depth)) = pending.pop() {
            if depth > 0 {
                let delay = jittered(self.params.split_delay_min, self.params.split_delay_max);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let request = FetchRequest::search(&cell, &self.options);
            let attempts = CountingExecutor::new(self.executor.as_ref());
            let result = fetch_with_retry(&attempts, &request, &self.params.retry).await;
            report.fetches += attempts.count();

            let result = result.and_then(|response| {
                SearchPage::from_body(&response.body)
                    .map(|page| (page, response))
                    .map_err(ExecuteError::Fetch)
            });

            match result {
                Ok((page, response)) => {
                    if self.is_leaf(&page, depth) {
                        report
                            .leaves
                            .push(self.accept(cell, depth, page.count, response.body, today));
                        continue;
                    }

                    let children = cell.split(self.params.divider).map_err(RefineError::Split)?;
                    tracing::debug!(
                        cell = cell.id(),
                        depth,
                        vehicles = page.count,
                        children = children.len(),
                        "splitting dense cell"
                    );
                    self.telemetry.record_cell_split();
                    report.splits += 1;
                    pending.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
                }
                Err(err) if err.is_pool_closed() => return Err(RefineError::PoolClosed),
                Err(err) => report.leaves.push(self.fail(cell, depth, err, today)),
            }
        }

        Ok(report)
    }

    fn is_leaf(&self, page: &SearchPage, depth: usize) -> bool {
        page.count < self.params.threshold
            || page.radius_exhausted()
            || depth > self.params.max_depth
    }

    fn accept(
        &self,
        mut cell: Cell,
        depth: usize,
        vehicle_count: usize,
        response: Value,
        today: NaiveDate,
    ) -> Leaf {
        cell.record_success(vehicle_count, today);
        self.telemetry.record_cell_accepted();
        tracing::debug!(cell = cell.id(), depth, vehicles = vehicle_count, "cell accepted");
        Leaf {
            cell,
            depth,
            outcome: LeafOutcome::Accepted {
                vehicle_count,
                response,
            },
        }
    }

    fn fail(&self, mut cell: Cell, depth: usize, err: ExecuteError, today: NaiveDate) -> Leaf {
        cell.record_failure(today);
        self.telemetry.record_cell_failed();
        tracing::warn!(cell = cell.id(), depth, error = %err, "search failed for cell");
        Leaf {
            cell,
            depth,
            outcome: LeafOutcome::Failed {
                error: err.to_string(),
            },
        }
    }
}

/// Counts the attempts a single retried fetch makes.
struct CountingExecutor<'a> {
    inner: &'a dyn FetchExecutor,
    calls: AtomicUsize,
}

impl<'a> CountingExecutor<'a> {
    fn new(inner: &'a dyn FetchExecutor) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    fn count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FetchExecutor for CountingExecutor<'_> {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ExecuteError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.fetch(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CellStatus, Coordinate};
    use crate::fetch::FetchError;
    use crate::pool::testing::StubFactory;
    use crate::pool::{PoolConfig, PoolError, WorkerPool};
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers each search with a count chosen from the requested cell's depth,
    /// derived from its width relative to the 2-degree root.
    struct DensityMap {
        counts: Box<dyn Fn(usize) -> Result<usize, ExecuteError> + Send + Sync>,
        radius: Option<f64>,
        depths: Mutex<Vec<usize>>,
    }

    impl DensityMap {
        fn new<F>(counts: F) -> Self
        where
            F: Fn(usize) -> Result<usize, ExecuteError> + Send + Sync + 'static,
        {
            Self {
                counts: Box::new(counts),
                radius: None,
                depths: Mutex::new(Vec::new()),
            }
        }

        fn requests_at(&self, depth: usize) -> usize {
            self.depths
                .lock()
                .unwrap()
                .iter()
                .filter(|d| **d == depth)
                .count()
        }
    }

    #[async_trait]
    impl FetchExecutor for DensityMap {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ExecuteError> {
            let location = &request.body.as_ref().unwrap()["filters"]["location"];
            let width = location["topRight"]["lng"].as_f64().unwrap()
                - location["bottomLeft"]["lng"].as_f64().unwrap();
            let depth = (2.0 / width).log2().round() as usize;
            self.depths.lock().unwrap().push(depth);

            let count = (self.counts)(depth)?;
            let vehicles: Vec<_> = (0..count).map(|id| json!({"id": id})).collect();
            let mut body = json!({"vehicles": vehicles});
            if let Some(radius) = self.radius {
                body["searchLocation"] = json!({"appliedRadius": {"value": radius}});
            }
            Ok(FetchResponse {
                status: 200,
                body,
                bytes: 0,
            })
        }
    }

    fn root() -> Cell {
        Cell::new(
            Coordinate::new(10.0, 10.0),
            Coordinate::new(8.0, 8.0),
            "US",
            2.0,
        )
        .unwrap()
    }

    fn params() -> RefineParams {
        RefineParams {
            retry: RetryPolicy {
                max_retries: 3,
                backoff_min: Duration::ZERO,
                backoff_max: Duration::ZERO,
            },
            split_delay_min: Duration::ZERO,
            split_delay_max: Duration::ZERO,
            ..RefineParams::default()
        }
    }

    fn search(executor: Arc<dyn FetchExecutor>, params: RefineParams) -> AdaptiveSearch {
        AdaptiveSearch::new(
            executor,
            SearchOptions::default(),
            params,
            Arc::new(Telemetry::default()),
        )
    }

    #[tokio::test]
    async fn sparse_cell_is_accepted_without_recursion() {
        let map = Arc::new(DensityMap::new(|_| Ok(50)));
        let report = search(map.clone(), params()).refine(root()).await.unwrap();

        assert_eq!(report.fetches, 1);
        assert_eq!(report.splits, 0);
        assert_eq!(report.leaves.len(), 1);
        let leaf = &report.leaves[0];
        assert_eq!(leaf.depth, 0);
        assert_eq!(leaf.cell.vehicle_count(), Some(50));
        assert_eq!(leaf.cell.status(), CellStatus::Success);
        assert!(leaf.cell.last_updated().is_some());
    }

    #[tokio::test]
    async fn dense_cell_splits_once_into_four_leaves() {
        let map = Arc::new(DensityMap::new(|depth| Ok(if depth == 0 { 500 } else { 50 })));
        let report = search(map.clone(), params()).refine(root()).await.unwrap();

        assert_eq!(map.requests_at(0), 1);
        assert_eq!(map.requests_at(1), 4);
        assert_eq!(report.fetches, 5);
        assert_eq!(report.accepted().count(), 4);
        assert!(report.leaves.iter().all(|leaf| leaf.depth == 1));

        let area: f64 = report.leaves.iter().map(|leaf| leaf.cell.area()).sum();
        assert!((area - root().area()).abs() < 1e-9);
        let expected: Vec<_> = root().split(2).unwrap().iter().map(|c| c.id().to_string()).collect();
        let actual: Vec<_> = report.leaves.iter().map(|l| l.cell.id().to_string()).collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn depth_bound_stops_runaway_density() {
        let map = Arc::new(DensityMap::new(|_| Ok(1000)));
        let report = search(
            map.clone(),
            RefineParams {
                max_depth: 2,
                ..params()
            },
        )
        .refine(root())
        .await
        .unwrap();

        assert_eq!(report.leaves.len(), 64);
        assert!(report.leaves.iter().all(|leaf| leaf.depth == 3 && leaf.is_accepted()));
        assert!(report
            .leaves
            .iter()
            .all(|leaf| leaf.cell.vehicle_count() == Some(1000)));
        assert_eq!(report.splits, 1 + 4 + 16);
        assert_eq!(map.requests_at(4), 0);
    }

    #[tokio::test]
    async fn exhausted_radius_is_a_leaf() {
        let mut map = DensityMap::new(|_| Ok(900));
        map.radius = Some(0.0);
        let report = search(Arc::new(map), params()).refine(root()).await.unwrap();
        assert_eq!(report.leaves.len(), 1);
        assert!(report.leaves[0].is_accepted());
    }

    #[tokio::test]
    async fn failed_cell_is_recorded_and_siblings_continue() {
        let map = Arc::new(DensityMap::new(|depth| match depth {
            0 => Ok(500),
            _ => Err(ExecuteError::Fetch(FetchError::HttpStatus { code: 502 })),
        }));
        let report = search(map.clone(), params()).refine(root()).await.unwrap();

        assert_eq!(report.failed().count(), 4);
        assert_eq!(map.requests_at(1), 16);
        let leaf = report.failed().next().unwrap();
        assert_eq!(leaf.cell.status(), CellStatus::Failed);
        assert!(matches!(&leaf.outcome, LeafOutcome::Failed { error } if error.contains("502")));
    }

    #[tokio::test]
    async fn closed_pool_aborts_refinement() {
        let map = Arc::new(DensityMap::new(|depth| match depth {
            0 => Ok(500),
            _ => Err(ExecuteError::Pool(PoolError::Closed)),
        }));
        let err = search(map, params()).refine(root()).await.unwrap_err();
        assert!(matches!(err, RefineError::PoolClosed));
    }

    #[tokio::test]
    async fn pooled_refinement_replaces_crashed_workers() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let factory = {
            let calls = calls.clone();
            Arc::new(StubFactory::with_responder(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(FetchError::Network("browser crashed".into()));
                }
                Ok(FetchResponse {
                    status: 200,
                    body: json!({"vehicles": [{"id": 1}]}),
                    bytes: 32,
                })
            }))
        };
        let pool = WorkerPool::new(
            PoolConfig {
                max_pool_size: 1,
                idle_timeout: Duration::from_secs(60),
                init_attempts: 1,
                init_backoff: Duration::ZERO,
            },
            factory.clone(),
            Arc::new(Telemetry::default()),
        );

        let report = search(Arc::new(pool.clone()), params())
            .refine(root())
            .await
            .unwrap();
        assert_eq!(report.fetches, 2);
        assert_eq!(report.accepted().count(), 1);
        assert_eq!(factory.built(), 2);
        assert_eq!(factory.worker(1).unwrap().destroy_calls(), 1);
        assert_eq!(pool.stats().members, 1);
    }
}
