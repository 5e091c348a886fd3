//! Per-delivery processing: decode, gate, fetch or refine, route every
//! result to the scraped or dead-letter destination, and settle last.
//!
//! A delivery is settled only after every outbound publish for it has
//! succeeded. Any error returned from [`process`] leaves it unsettled so the
//! broker hands it out again.

use super::context::HarvestContext;
use super::records::{FailureRecord, ListingSummary, ScrapedRecord};
use crate::broker::{BrokerError, ConsumerSession, Delivery};
use crate::domain::{
    CellStatus, CellTarget, DeliveryPosition, Vehicle, VehicleTarget, WorkItem, WorkKind,
    WorkPayload,
};
use crate::fetch::request::listing_ids;
use crate::fetch::FetchRequest;
use crate::gate::GateDecision;
use crate::search::{fetch_with_retry, LeafOutcome, RefineError};
use chrono::Utc;
use std::fmt;

/// How a delivery left the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed and settled.
    Completed { scraped: usize, dead_lettered: usize },
    /// Undecodable; dead-lettered and settled.
    Rejected,
    /// Job cancelled; settled without processing.
    Dropped,
    /// Job stopped; left unsettled.
    Deferred,
    /// Job state unknown; left unsettled.
    Unresolved,
}

impl Outcome {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Outcome::Completed { .. } | Outcome::Rejected | Outcome::Dropped
        )
    }
}

#[derive(Debug)]
pub enum ProcessError {
    Publish {
        destination: String,
        source: BrokerError,
    },
    Settle(BrokerError),
    Encode(serde_json::Error),
    /// The pool closed underneath the work item.
    PoolClosed,
}

impl ProcessError {
    /// The broker error that made the session unusable, if this was one.
    pub fn lost_session(&self) -> Option<&BrokerError> {
        match self {
            ProcessError::Publish { source, .. } | ProcessError::Settle(source)
                if source.is_connection() || *source == BrokerError::Closed =>
            {
                Some(source)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Publish {
                destination,
                source,
            } => write!(f, "failed to publish to {destination}: {source}"),
            ProcessError::Settle(err) => write!(f, "failed to settle delivery: {err}"),
            ProcessError::Encode(err) => write!(f, "failed to encode outbound message: {err}"),
            ProcessError::PoolClosed => write!(f, "worker pool closed"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Publish { source, .. } => Some(source),
            ProcessError::Settle(err) => Some(err),
            ProcessError::Encode(err) => Some(err),
            ProcessError::PoolClosed => None,
        }
    }
}

impl From<serde_json::Error> for ProcessError {
    fn from(err: serde_json::Error) -> Self {
        ProcessError::Encode(err)
    }
}

/// Processes one delivery end to end.
#[tracing::instrument(name = "work_item", skip_all, fields(kind = %ctx.kind()))]
pub async fn process(
    ctx: &HarvestContext,
    session: &dyn ConsumerSession,
    delivery: Delivery,
) -> Result<Outcome, ProcessError> {
    let Delivery { position, payload } = delivery;
    let item = match WorkItem::parse(ctx.kind(), &payload, position.clone()) {
        Ok(item) => item,
        Err(err) => {
            tracing::warn!(error = %err, "rejecting undecodable work item");
            let record = FailureRecord::new(
                ctx.kind(),
                err.target_id().map(str::to_owned),
                err.to_string(),
                None,
            );
            dead_letter(ctx, session, &record).await?;
            settle(session, &position).await?;
            return Ok(Outcome::Rejected);
        }
    };

    match ctx.gate().check(&item.job_id).await {
        GateDecision::Proceed(_) => {}
        GateDecision::Drop => {
            settle(session, &item.position).await?;
            return Ok(Outcome::Dropped);
        }
        GateDecision::Defer => return Ok(Outcome::Deferred),
        GateDecision::Unknown(_) => return Ok(Outcome::Unresolved),
    }

    let (scraped, dead_lettered) = match &item.payload {
        WorkPayload::CellSearch(target) => search_cell(ctx, session, &item, target).await?,
        WorkPayload::VehiclePricing(target) | WorkPayload::VehicleDetail(target) => {
            fetch_vehicle(ctx, session, &item, target).await?
        }
    };

    settle(session, &item.position).await?;
    tracing::debug!(
        job_id = %item.job_id,
        target = item.target_id().as_deref().unwrap_or_default(),
        scraped,
        dead_lettered,
        "work item settled"
    );
    Ok(Outcome::Completed {
        scraped,
        dead_lettered,
    })
}

/// Refines the cell and emits one message per leaf.
async fn search_cell(
    ctx: &HarvestContext,
    session: &dyn ConsumerSession,
    item: &WorkItem,
    target: &CellTarget,
) -> Result<(usize, usize), ProcessError> {
    let base_id = item.target_id();
    let mut base = match target.to_cell() {
        Ok(cell) => cell,
        Err(err) => {
            let record = FailureRecord::new(
                WorkKind::CellSearch,
                base_id,
                err.to_string(),
                Some(item.job_id.clone()),
            );
            dead_letter(ctx, session, &record).await?;
            return Ok((0, 1));
        }
    };
    let base_id = base_id.unwrap_or_else(|| base.id().to_string());

    let report = match ctx.search().refine(base.clone()).await {
        Ok(report) => report,
        Err(RefineError::PoolClosed) => return Err(ProcessError::PoolClosed),
        Err(err @ RefineError::Split(_)) => {
            let record = FailureRecord::new(
                WorkKind::CellSearch,
                Some(base_id),
                err.to_string(),
                Some(item.job_id.clone()),
            );
            dead_letter(ctx, session, &record).await?;
            return Ok((0, 1));
        }
    };

    let today = Utc::now().date_naive();
    if report.failed().next().is_none() {
        let total: usize = report
            .leaves
            .iter()
            .filter_map(|leaf| leaf.cell.vehicle_count())
            .sum();
        base.record_success(total, today);
    } else {
        base.record_failure(today);
    }
    let country = base.country().to_string();
    ctx.metadata().upsert_base_cell(base).await;

    let metadata = ctx.metadata();
    let (mut scraped, mut dead_lettered) = (0, 0);
    for leaf in report.leaves {
        let leaf_id = leaf.cell.id().to_string();
        metadata.upsert_optimal_cell(leaf.cell).await;

        match leaf.outcome {
            LeafOutcome::Accepted { response, .. } => {
                let vehicles: Vec<ListingSummary> = listing_ids(&response)
                    .into_iter()
                    .map(|id| ListingSummary {
                        id,
                        country: country.clone(),
                        cell_id: leaf_id.clone(),
                        search_last_updated: today,
                    })
                    .collect();
                for vehicle in &vehicles {
                    metadata.upsert_vehicle(vehicle.to_vehicle()).await;
                }

                let record = ScrapedRecord {
                    kind: WorkKind::CellSearch,
                    target_id: leaf_id,
                    scraped: response,
                    job_id: item.job_id.clone(),
                    base_cell_id: Some(base_id.clone()),
                    vehicles: Some(vehicles),
                };
                publish_scraped(ctx, session, &record).await?;
                scraped += 1;
            }
            LeafOutcome::Failed { error } => {
                let record = FailureRecord::new(
                    WorkKind::CellSearch,
                    Some(leaf_id),
                    error,
                    Some(item.job_id.clone()),
                );
                dead_letter(ctx, session, &record).await?;
                dead_lettered += 1;
            }
        }
    }

    Ok((scraped, dead_lettered))
}

/// One pricing or detail fetch, retried on fresh workers.
async fn fetch_vehicle(
    ctx: &HarvestContext,
    session: &dyn ConsumerSession,
    item: &WorkItem,
    target: &VehicleTarget,
) -> Result<(usize, usize), ProcessError> {
    let kind = item.kind();
    let request = match kind {
        WorkKind::VehiclePricing => FetchRequest::pricing(target),
        _ => FetchRequest::detail(target),
    };

    let mut vehicle = Vehicle::new(target.vehicle_id.clone());
    vehicle.country = target.country.clone();

    match fetch_with_retry(ctx.pool(), &request, ctx.retry()).await {
        Ok(response) => {
            let today = Utc::now().date_naive();
            match kind {
                WorkKind::VehiclePricing => vehicle.pricing_last_updated = Some(today),
                _ => vehicle.detail_last_updated = Some(today),
            }
            ctx.metadata().upsert_vehicle(vehicle).await;

            let record = ScrapedRecord {
                kind,
                target_id: target.vehicle_id.clone(),
                scraped: response.body,
                job_id: item.job_id.clone(),
                base_cell_id: None,
                vehicles: None,
            };
            publish_scraped(ctx, session, &record).await?;
            Ok((1, 0))
        }
        Err(err) if err.is_pool_closed() => Err(ProcessError::PoolClosed),
        Err(err) => {
            tracing::warn!(
                vehicle = %target.vehicle_id,
                job_id = %item.job_id,
                error = %err,
                "vehicle fetch failed after retries"
            );
            vehicle.status = CellStatus::Failed;
            ctx.metadata().upsert_vehicle(vehicle).await;

            let record = FailureRecord::new(
                kind,
                Some(target.vehicle_id.clone()),
                err.to_string(),
                Some(item.job_id.clone()),
            );
            dead_letter(ctx, session, &record).await?;
            Ok((0, 1))
        }
    }
}

async fn publish_scraped(
    ctx: &HarvestContext,
    session: &dyn ConsumerSession,
    record: &ScrapedRecord,
) -> Result<(), ProcessError> {
    let destination = &ctx.destinations().scraped;
    publish(session, destination, record.encode()?).await?;
    ctx.telemetry().record_scraped_published();
    Ok(())
}

async fn dead_letter(
    ctx: &HarvestContext,
    session: &dyn ConsumerSession,
    record: &FailureRecord,
) -> Result<(), ProcessError> {
    let destination = &ctx.destinations().dead_letter;
    publish(session, destination, record.encode()?).await?;
    ctx.telemetry().record_dead_letter();
    tracing::info!(
        destination = %destination,
        target = record.target_id.as_deref().unwrap_or_default(),
        error = %record.error,
        "failure record published"
    );
    Ok(())
}

async fn publish(
    session: &dyn ConsumerSession,
    destination: &str,
    body: Vec<u8>,
) -> Result<(), ProcessError> {
    session
        .publish(destination, &body)
        .await
        .map_err(|source| ProcessError::Publish {
            destination: destination.to_string(),
            source,
        })
}

async fn settle(
    session: &dyn ConsumerSession,
    position: &DeliveryPosition,
) -> Result<(), ProcessError> {
    session.settle(position).await.map_err(ProcessError::Settle)
}
