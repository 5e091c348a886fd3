use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{builder, context, init_tracing, queue_harvester, wait_for},
    marketplace::{DensityResponder, MockMarketplace},
};
use anyhow::{Context, Result};
use cellharvest::{MemoryQueue, Runner, WorkKind};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn job_service(job_id: &str, status: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/jobs/{job_id}/status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": status})))
        .mount(&server)
        .await;
    server
}

fn pricing_message(job_id: &str) -> Vec<u8> {
    json!({
        "vehicleId": "4242",
        "jobId": job_id,
        "startDate": "2024-01-01",
        "endDate": "2024-01-31",
    })
    .to_string()
    .into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_job_is_acked_without_touching_the_marketplace() -> Result<()> {
    init_tracing();
    let market = MockMarketplace::start().await;
    market.mount_pricing().await;
    market.mount_search(DensityResponder::new(1)).await;
    let jobs = job_service("job-9", "CANCELLED").await;

    let config = builder(WorkKind::VehiclePricing, &market.uri())
        .job_status_url(jobs.uri())
        .build()?;
    let client = config
        .job_status_client()?
        .context("job status url was configured")?;
    let queue = MemoryQueue::new();
    let destinations = config.destinations().clone();
    queue.push(&destinations.source, &pricing_message("job-9"));

    let mut runner = Runner::new(queue_harvester(&config, Arc::new(client), &queue));
    let ctx = context(runner.harvester());
    runner.start();

    let acked = &queue;
    wait_for("cancelled item ack", move || async move { acked.ack_calls() == 1 }).await?;
    assert_eq!(ctx.pool().stats().members, 0);
    runner.stop().await?;

    assert_eq!(market.total_requests().await, 0, "no worker was ever warmed up");
    assert!(queue.ready_messages(&destinations.scraped).is_empty());
    assert!(queue.ready_messages(&destinations.dead_letter).is_empty());
    assert_eq!(ctx.telemetry().snapshot().gate_dropped, 1);
    assert_eq!(ctx.telemetry().snapshot().workers_created, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_job_is_left_for_redelivery() -> Result<()> {
    init_tracing();
    let market = MockMarketplace::start().await;
    market.mount_pricing().await;
    let jobs = job_service("job-3", "STOPPED").await;

    let config = builder(WorkKind::VehiclePricing, &market.uri())
        .job_status_url(jobs.uri())
        .gate_timeout(Duration::from_secs(2))
        .build()?;
    let client = config
        .job_status_client()?
        .context("job status url was configured")?;
    let queue = MemoryQueue::new();
    let destinations = config.destinations().clone();
    queue.push(&destinations.source, &pricing_message("job-3"));

    let mut runner = Runner::new(queue_harvester(&config, Arc::new(client), &queue));
    let ctx = context(runner.harvester());
    runner.start();

    let deferred = ctx.clone();
    wait_for("deferred item", move || {
        let ctx = deferred.clone();
        async move { ctx.telemetry().snapshot().gate_deferred >= 1 }
    })
    .await?;
    runner.stop().await?;

    assert_eq!(queue.ack_calls(), 0);
    assert_eq!(
        queue.ready_len(&destinations.source),
        1,
        "dropping the session hands the item back"
    );
    assert_eq!(market.total_requests().await, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_job_service_leaves_item_unsettled() -> Result<()> {
    init_tracing();
    let market = MockMarketplace::start().await;
    let config = builder(WorkKind::VehiclePricing, &market.uri())
        .job_status_url("http://127.0.0.1:9")
        .gate_timeout(Duration::from_millis(500))
        .build()?;
    let client = config
        .job_status_client()?
        .context("job status url was configured")?;
    let queue = MemoryQueue::new();
    let destinations = config.destinations().clone();
    queue.push(&destinations.source, &pricing_message("job-4"));

    let mut runner = Runner::new(queue_harvester(&config, Arc::new(client), &queue));
    let ctx = context(runner.harvester());
    runner.start();

    let unknown = ctx.clone();
    wait_for("unresolved gate", move || {
        let ctx = unknown.clone();
        async move { ctx.telemetry().snapshot().gate_unknown >= 1 }
    })
    .await?;
    runner.stop().await?;

    assert_eq!(queue.ack_calls(), 0);
    assert_eq!(queue.ready_len(&destinations.source), 1);
    assert!(queue.ready_messages(&destinations.dead_letter).is_empty());
    Ok(())
}
