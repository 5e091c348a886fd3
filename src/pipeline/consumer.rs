//! Intake loop for one consumer session.
//!
//! Deliveries are pulled only while an in-flight permit is free, each one is
//! processed on its own task, and the pool's backpressure signal is mirrored
//! onto the session as pause/resume.

use super::context::HarvestContext;
use super::handler::{process, Outcome, ProcessError};
use crate::broker::{BrokerError, ConsumerSession};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Consumes `session` until shutdown, source shutdown, or a session-level
/// broker error. In-flight work items are always allowed to finish before
/// this returns.
pub async fn consume(
    ctx: Arc<HarvestContext>,
    session: Arc<dyn ConsumerSession>,
    shutdown: CancellationToken,
) -> Result<(), BrokerError> {
    let permits = Arc::new(Semaphore::new(ctx.max_in_flight()));
    let mut backpressure = ctx.pool().backpressure();
    let mut tasks: JoinSet<Result<Outcome, ProcessError>> = JoinSet::new();
    let mut permit: Option<OwnedSemaphorePermit> = None;

    mirror_backpressure(session.as_ref(), *backpressure.borrow_and_update());

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Some(err) = finished(joined) {
                    break Err(err);
                }
            }
            Ok(()) = backpressure.changed() => {
                mirror_backpressure(session.as_ref(), *backpressure.borrow_and_update());
            }
            acquired = permits.clone().acquire_owned(), if permit.is_none() => match acquired {
                Ok(acquired) => permit = Some(acquired),
                Err(_) => break Ok(()),
            },
            next = session.next(), if permit.is_some() => match next {
                Ok(Some(delivery)) => {
                    let permit = permit.take();
                    let activity = ctx.pool().track();
                    let ctx = ctx.clone();
                    let session = session.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _activity = activity;
                        process(&ctx, session.as_ref(), delivery).await
                    });
                }
                Ok(None) => {
                    tracing::info!("source shut down; consumer stopping");
                    break Ok(());
                }
                Err(err) => break Err(err),
            },
        }
    };

    if !tasks.is_empty() {
        tracing::info!(in_flight = tasks.len(), "waiting for in-flight work items");
    }
    while let Some(joined) = tasks.join_next().await {
        finished(joined);
    }

    result
}

fn mirror_backpressure(session: &dyn ConsumerSession, saturated: bool) {
    if saturated {
        session.pause();
    } else {
        session.resume();
    }
}

/// Logs a finished task and returns the broker error if it lost the session.
fn finished(joined: Result<Result<Outcome, ProcessError>, JoinError>) -> Option<BrokerError> {
    match joined {
        Ok(Ok(outcome)) => {
            tracing::trace!(?outcome, "work item finished");
            None
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "work item left unsettled");
            err.lost_session().cloned()
        }
        Err(err) => {
            tracing::error!(error = %err, "work item task aborted");
            None
        }
    }
}
