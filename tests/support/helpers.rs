use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use cellharvest::{
    HarvestContext, Harvester, HarvesterConfig, HarvesterConfigBuilder, HttpWorkerFactory,
    JobStatus, JobStatusSource, MemoryJobStatus, MemoryQueue, QueueBroker, WorkKind,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

pub const JOB: &str = "job-1";

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Fast retries and no pacing so a whole item completes in milliseconds.
pub fn builder(kind: WorkKind, origin: &str) -> HarvesterConfigBuilder {
    HarvesterConfig::builder()
        .kind(kind)
        .origin(origin)
        .max_pool_size(2)
        .max_retries(1)
        .retry_backoff(Duration::ZERO, Duration::ZERO)
        .split_delay(Duration::ZERO, Duration::ZERO)
        .worker_init_backoff(Duration::ZERO)
        .reconnect_delay(Duration::from_millis(10))
        .metrics_interval(Duration::from_millis(50))
}

pub fn running_jobs() -> Arc<MemoryJobStatus> {
    let jobs = Arc::new(MemoryJobStatus::new());
    jobs.set(JOB, JobStatus::Running);
    jobs
}

/// A harvester fetching over HTTP and consuming from `queue`.
pub fn queue_harvester(
    config: &HarvesterConfig,
    jobs: Arc<dyn JobStatusSource>,
    queue: &MemoryQueue,
) -> Harvester {
    let factory = Arc::new(HttpWorkerFactory::new(config.worker_config()));
    let broker = Arc::new(QueueBroker::new(Arc::new(queue.clone())));
    Harvester::from_config(config, factory, jobs, broker)
}

pub fn context(harvester: &Harvester) -> Arc<HarvestContext> {
    harvester.context().clone()
}

pub fn decode_all(messages: Vec<Vec<u8>>) -> Vec<Value> {
    messages
        .iter()
        .map(|body| serde_json::from_slice(body).expect("published records are JSON"))
        .collect()
}

/// Polls `condition` until it holds or the wait times out.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if condition().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        sleep(POLL_INTERVAL).await;
    }
}
