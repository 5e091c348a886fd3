use super::error::BrokerError;
use super::session::{Broker, ConsumerSession};
use crate::runtime::backoff::sleep_with_cancellation;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connects, hands the session to `consume`, and on any connection-level
/// failure tears down and tries again after `reconnect_delay`, indefinitely.
///
/// Returns `Ok(())` once `consume` finishes cleanly or `shutdown` fires, and
/// `Err(BrokerError::Closed)` if the transport is gone for good.
pub async fn supervise<F, Fut>(
    broker: &dyn Broker,
    source: &str,
    max_in_flight: usize,
    reconnect_delay: Duration,
    shutdown: &CancellationToken,
    mut consume: F,
) -> Result<(), BrokerError>
where
    F: FnMut(Arc<dyn ConsumerSession>) -> Fut,
    Fut: Future<Output = Result<(), BrokerError>>,
{
    let mut failures: u64 = 0;

    loop {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = broker.connect(source, max_in_flight) => result,
        };

        let err = match connected {
            Ok(session) => {
                if failures > 0 {
                    tracing::info!(broker = broker.name(), source, failures, "reconnected to broker");
                }
                failures = 0;
                match consume(session).await {
                    Ok(()) => return Ok(()),
                    Err(BrokerError::Closed) => return Err(BrokerError::Closed),
                    Err(err) => err,
                }
            }
            Err(BrokerError::Closed) => return Err(BrokerError::Closed),
            Err(err) => err,
        };

        failures += 1;
        tracing::warn!(
            broker = broker.name(),
            source,
            failures,
            delay_ms = reconnect_delay.as_millis() as u64,
            error = %err,
            "consumer lost its broker; reconnecting"
        );
        if sleep_with_cancellation(reconnect_delay, Some(shutdown)).await.is_err() {
            return Ok(());
        }
    }
}
