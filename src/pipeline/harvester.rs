use super::consumer::consume;
use super::context::HarvestContext;
use crate::broker::{supervise, Broker};
use crate::fetch::WorkerFactory;
use crate::gate::JobStatusSource;
use crate::runtime::config::HarvesterConfig;
use crate::runtime::telemetry::spawn_metrics_reporter;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One pipeline bound to a broker: supervised consumption, metrics, and a
/// graceful pool shutdown once consumption ends.
pub struct Harvester {
    ctx: Arc<HarvestContext>,
    broker: Arc<dyn Broker>,
    reconnect_delay: Duration,
    metrics_interval: Duration,
}

impl Harvester {
    pub fn new(config: &HarvesterConfig, ctx: HarvestContext, broker: Arc<dyn Broker>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            broker,
            reconnect_delay: config.reconnect_delay(),
            metrics_interval: config.metrics_interval(),
        }
    }

    /// Builds the context from `config` and wires it to `broker`.
    pub fn from_config(
        config: &HarvesterConfig,
        factory: Arc<dyn WorkerFactory>,
        jobs: Arc<dyn JobStatusSource>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let ctx = HarvestContext::new(config, factory, jobs);
        Self::new(config, ctx, broker)
    }

    pub fn context(&self) -> &Arc<HarvestContext> {
        &self.ctx
    }

    /// Consumes until `shutdown` fires or the source ends, then closes the pool.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let ctx = &self.ctx;
        let source = ctx.destinations().source.clone();
        let metrics_shutdown = shutdown.child_token();
        let reporter = spawn_metrics_reporter(
            ctx.telemetry().clone(),
            ctx.pool().clone(),
            metrics_shutdown.clone(),
            self.metrics_interval,
        );

        tracing::info!(
            broker = self.broker.name(),
            source = %source,
            kind = %ctx.kind(),
            max_in_flight = ctx.max_in_flight(),
            "harvester starting"
        );
        let result = supervise(
            self.broker.as_ref(),
            &source,
            ctx.max_in_flight(),
            self.reconnect_delay,
            &shutdown,
            |session| consume(ctx.clone(), session, shutdown.clone()),
        )
        .await;

        ctx.pool().close().await;
        metrics_shutdown.cancel();
        if let Err(err) = reporter.await {
            tracing::warn!(error = %err, "metrics reporter ended abnormally");
        }
        tracing::info!(source = %source, "harvester stopped");

        result.with_context(|| format!("consumer on {source} stopped"))
    }
}
