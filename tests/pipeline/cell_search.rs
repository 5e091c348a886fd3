use std::collections::HashSet;

use crate::support::{
    helpers::{builder, context, decode_all, init_tracing, queue_harvester, running_jobs, wait_for, JOB},
    marketplace::{DensityResponder, MockMarketplace, SEARCH_PATH},
};
use anyhow::Result;
use cellharvest::{MemoryQueue, Runner, WorkKind};
use serde_json::{json, Value};

fn cell_message() -> Value {
    json!({
        "id": "base-8-8",
        "bottomLeftLat": 8,
        "bottomLeftLng": 8,
        "topRightLat": 10,
        "topRightLng": 10,
        "cellSize": 2.0,
        "jobId": JOB,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dense_cell_is_refined_into_published_leaves() -> Result<()> {
    init_tracing();
    let market = MockMarketplace::start().await;
    market.mount_search(DensityResponder::new(5)).await;

    let config = builder(WorkKind::CellSearch, &market.uri())
        .threshold(4)
        .build()?;
    let queue = MemoryQueue::new();
    let destinations = config.destinations().clone();
    queue.push(&destinations.source, cell_message().to_string().as_bytes());

    let mut runner = Runner::new(queue_harvester(&config, running_jobs(), &queue));
    let ctx = context(runner.harvester());
    runner.start();

    let acked = &queue;
    wait_for("cell message ack", move || async move { acked.ack_calls() == 1 }).await?;
    runner.stop().await?;

    let scraped = decode_all(queue.ready_messages(&destinations.scraped));
    assert_eq!(scraped.len(), 4);
    assert!(queue.ready_messages(&destinations.dead_letter).is_empty());

    let leaf_ids: HashSet<&str> = scraped
        .iter()
        .filter_map(|record| record["cellId"].as_str())
        .collect();
    assert_eq!(leaf_ids.len(), 4);
    for record in &scraped {
        assert_eq!(record["baseCellId"], "base-8-8");
        assert_eq!(record["jobId"], JOB);
        let vehicles = record["vehicles"].as_array().expect("search records list vehicles");
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0]["cellId"], record["cellId"]);
        assert_eq!(vehicles[0]["country"], "US");
        assert_eq!(record["scraped"]["vehicles"].as_array().map(Vec::len), Some(1));
    }

    // One root search plus one per quadrant.
    assert_eq!(market.requests_to(SEARCH_PATH).await, 5);

    let counts = ctx.metadata().counts().await;
    assert_eq!(counts.base_cells, 1);
    assert_eq!(counts.optimal_cells, 4);
    assert_eq!(counts.vehicles, 4);

    let snapshot = ctx.telemetry().snapshot();
    assert_eq!(snapshot.cells_split, 1);
    assert_eq!(snapshot.cells_accepted, 4);
    assert_eq!(snapshot.scraped_published, 4);
    assert_eq!(ctx.pool().stats().members, 0, "stop closes the pool");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_leaf_is_dead_lettered_next_to_its_siblings() -> Result<()> {
    init_tracing();
    let market = MockMarketplace::start().await;
    market
        .mount_search(DensityResponder::new(5).failing_at(9.0, 9.0))
        .await;

    let config = builder(WorkKind::CellSearch, &market.uri())
        .threshold(4)
        .build()?;
    let queue = MemoryQueue::new();
    let destinations = config.destinations().clone();
    queue.push(&destinations.source, cell_message().to_string().as_bytes());

    let mut runner = Runner::new(queue_harvester(&config, running_jobs(), &queue));
    let ctx = context(runner.harvester());
    runner.start();

    let acked = &queue;
    wait_for("cell message ack", move || async move { acked.ack_calls() == 1 }).await?;
    runner.stop().await?;

    assert_eq!(queue.ready_messages(&destinations.scraped).len(), 3);
    let dead_letters = decode_all(queue.ready_messages(&destinations.dead_letter));
    assert_eq!(dead_letters.len(), 1);
    let record = &dead_letters[0];
    assert_eq!(record["jobId"], JOB);
    assert!(record["cellId"].is_string());
    assert!(record["error"].as_str().is_some_and(|error| !error.is_empty()));
    assert!(record["timestamp"].as_str().is_some_and(|ts| ts.ends_with('Z')));

    let snapshot = ctx.telemetry().snapshot();
    assert_eq!(snapshot.cells_failed, 1);
    assert_eq!(snapshot.dead_lettered, 1);
    // The failing box was tried once plus one retry.
    assert_eq!(market.requests_to(SEARCH_PATH).await, 6);
    Ok(())
}
