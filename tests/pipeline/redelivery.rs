use std::sync::Arc;

use crate::support::{
    helpers::{builder, decode_all, init_tracing, running_jobs, wait_for, JOB},
    marketplace::{pricing_body, MockMarketplace, PRICING_PATH},
};
use anyhow::Result;
use cellharvest::{
    BrokerFlavor, Harvester, HarvesterConfig, HttpWorkerFactory, MemoryLog, MemoryQueue, Runner,
    WorkKind,
};
use serde_json::json;

fn log_harvester(config: &HarvesterConfig, log: &MemoryLog) -> Harvester {
    let factory = Arc::new(HttpWorkerFactory::new(config.worker_config()));
    let broker = Arc::new(config.log_broker(Arc::new(log.clone())));
    Harvester::from_config(config, factory, running_jobs(), broker)
}

fn pricing_message() -> Vec<u8> {
    json!({
        "vehicleId": 777,
        "jobId": JOB,
        "startDate": "2024-01-01",
        "endDate": "2024-01-31",
    })
    .to_string()
    .into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unpublished_record_is_redelivered_after_restart() -> Result<()> {
    init_tracing();
    let market = MockMarketplace::start().await;
    market.mount_pricing().await;

    let config = builder(WorkKind::VehiclePricing, &market.uri())
        .broker_flavor(BrokerFlavor::Log)
        .build()?;
    let destinations = config.destinations().clone();
    assert!(destinations.source.ends_with("-topic"));

    let log = MemoryLog::new(1);
    log.append(&destinations.source, 0, &pricing_message());
    log.fail_next_publishes(1);

    // First run fetches, fails to publish, and must not commit.
    let mut first = Runner::new(log_harvester(&config, &log));
    first.start();
    let fetched = &market;
    wait_for("first pricing fetch", move || async move {
        fetched.requests_to(PRICING_PATH).await >= 1
    })
    .await?;
    first.stop().await?;

    assert_eq!(log.committed(&destinations.source, 0), None);
    assert!(log.records(&destinations.scraped).is_empty());

    // Second run starts from the committed offset and finishes the record.
    let mut second = Runner::new(log_harvester(&config, &log));
    second.start();
    let committed = &log;
    let source = destinations.source.clone();
    wait_for("offset commit", move || {
        let source = source.clone();
        async move { committed.committed(&source, 0) == Some(1) }
    })
    .await?;
    second.stop().await?;

    let scraped = decode_all(log.records(&destinations.scraped));
    assert_eq!(scraped.len(), 1);
    assert_eq!(scraped[0]["vehicleId"], "777");
    assert_eq!(scraped[0]["jobId"], JOB);
    assert_eq!(scraped[0]["scraped"], pricing_body());
    assert_eq!(market.requests_to(PRICING_PATH).await, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_reconnects_after_connection_loss() -> Result<()> {
    init_tracing();
    let market = MockMarketplace::start().await;
    market.mount_pricing().await;

    let config = builder(WorkKind::VehiclePricing, &market.uri()).build()?;
    let destinations = config.destinations().clone();
    let queue = MemoryQueue::new();
    queue.push(&destinations.source, &pricing_message());

    let mut runner = Runner::new(crate::support::helpers::queue_harvester(
        &config,
        running_jobs(),
        &queue,
    ));
    runner.start();

    let acked = &queue;
    wait_for("first ack", move || async move { acked.ack_calls() == 1 }).await?;

    queue.disconnect();
    queue.push(&destinations.source, &pricing_message());
    wait_for("ack after reconnect", move || async move { acked.ack_calls() == 2 }).await?;
    runner.stop().await?;

    assert_eq!(queue.ready_messages(&destinations.scraped).len(), 2);
    assert_eq!(queue.ready_len(&destinations.source), 0);
    Ok(())
}
