use crate::pool::WorkerPool;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
    fetch_bytes: AtomicU64,
    workers_created: AtomicU64,
    workers_destroyed: AtomicU64,
    idle_evictions: AtomicU64,
    cells_accepted: AtomicU64,
    cells_split: AtomicU64,
    cells_failed: AtomicU64,
    scraped_published: AtomicU64,
    dead_lettered: AtomicU64,
    gate_dropped: AtomicU64,
    gate_deferred: AtomicU64,
    gate_unknown: AtomicU64,
    backpressure_pauses: AtomicU64,
    pool_size: AtomicUsize,
}

impl Telemetry {
    pub fn record_fetch(&self, bytes: usize) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.fetch_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_created(&self, pool_size: usize) {
        self.workers_created.fetch_add(1, Ordering::Relaxed);
        self.pool_size.store(pool_size, Ordering::Relaxed);
    }

    pub fn record_worker_destroyed(&self, pool_size: usize, idle: bool) {
        self.workers_destroyed.fetch_add(1, Ordering::Relaxed);
        if idle {
            self.idle_evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.pool_size.store(pool_size, Ordering::Relaxed);
    }

    pub fn record_cell_accepted(&self) {
        self.cells_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cell_split(&self) {
        self.cells_split.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cell_failed(&self) {
        self.cells_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scraped_published(&self) {
        self.scraped_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gate_dropped(&self) {
        self.gate_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gate_deferred(&self) {
        self.gate_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gate_unknown(&self) {
        self.gate_unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure_pause(&self) {
        self.backpressure_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            fetch_bytes: self.fetch_bytes.load(Ordering::Relaxed),
            workers_created: self.workers_created.load(Ordering::Relaxed),
            workers_destroyed: self.workers_destroyed.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
            cells_accepted: self.cells_accepted.load(Ordering::Relaxed),
            cells_split: self.cells_split.load(Ordering::Relaxed),
            cells_failed: self.cells_failed.load(Ordering::Relaxed),
            scraped_published: self.scraped_published.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            gate_dropped: self.gate_dropped.load(Ordering::Relaxed),
            gate_deferred: self.gate_deferred.load(Ordering::Relaxed),
            gate_unknown: self.gate_unknown.load(Ordering::Relaxed),
            backpressure_pauses: self.backpressure_pauses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub fetches: u64,
    pub fetch_errors: u64,
    pub fetch_bytes: u64,
    pub workers_created: u64,
    pub workers_destroyed: u64,
    pub idle_evictions: u64,
    pub cells_accepted: u64,
    pub cells_split: u64,
    pub cells_failed: u64,
    pub scraped_published: u64,
    pub dead_lettered: u64,
    pub gate_dropped: u64,
    pub gate_deferred: u64,
    pub gate_unknown: u64,
    pub backpressure_pauses: u64,
}

/// Spawns a background task that periodically logs fetch throughput, pool occupancy, and outcomes.
pub fn spawn_metrics_reporter(
    telemetry: std::sync::Arc<Telemetry>,
    pool: WorkerPool,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "cellharvest::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let fetch_delta = current.fetches.saturating_sub(last_snapshot.fetches);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        fetch_delta as f64 / elapsed
                    };
                    let stats = pool.stats();

                    tracing::info!(
                        target: "cellharvest::metrics",
                        throughput = format!("{throughput:.2}"),
                        fetches = current.fetches,
                        fetch_errors = current.fetch_errors,
                        fetch_bytes = current.fetch_bytes,
                        pool_members = stats.members,
                        pool_lent = stats.lent,
                        pool_waiting = stats.waiting,
                        paused = stats.paused,
                        cells_accepted = current.cells_accepted,
                        cells_failed = current.cells_failed,
                        dead_lettered = current.dead_lettered,
                        gate_dropped = current.gate_dropped,
                        gate_deferred = current.gate_deferred,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use std::sync::Arc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn telemetry_records_counters() {
        let telemetry = Telemetry::default();
        telemetry.record_fetch(120);
        telemetry.record_fetch_error();
        telemetry.record_worker_created(1);
        telemetry.record_worker_created(2);
        telemetry.record_worker_destroyed(1, true);
        telemetry.record_gate_dropped();
        telemetry.record_backpressure_pause();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.fetches, 2);
        assert_eq!(snapshot.fetch_errors, 1);
        assert_eq!(snapshot.fetch_bytes, 120);
        assert_eq!(snapshot.workers_created, 2);
        assert_eq!(snapshot.idle_evictions, 1);
        assert_eq!(snapshot.gate_dropped, 1);
        assert_eq!(snapshot.backpressure_pauses, 1);
        assert_eq!(telemetry.pool_size(), 1);
    }

    #[tokio::test]
    async fn metrics_reporter_logs_until_shutdown() {
        let telemetry = Arc::new(Telemetry::default());
        let pool = WorkerPool::new(
            PoolConfig::default(),
            Arc::new(crate::pool::testing::StubFactory::default()),
            telemetry.clone(),
        );

        let shutdown = CancellationToken::new();
        let handle = spawn_metrics_reporter(
            telemetry,
            pool,
            shutdown.clone(),
            Duration::from_millis(10),
        );

        shutdown.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop promptly")
            .expect("task should not panic");
    }
}
