use super::error::BrokerError;
use crate::domain::DeliveryPosition;
use async_trait::async_trait;
use std::sync::Arc;

/// One received message and the position needed to settle exactly it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub position: DeliveryPosition,
    pub payload: Vec<u8>,
}

/// Broker-neutral consumer contract shared by the log and queue bindings.
///
/// `settle` commits or acks a delivery and must only be called once
/// processing has finished; settling the same position again is a no-op.
/// `pause` and `resume` are idempotent.
#[async_trait]
pub trait ConsumerSession: Send + Sync {
    /// Waits for the next delivery. `Ok(None)` means the source has shut down.
    async fn next(&self) -> Result<Option<Delivery>, BrokerError>;

    async fn settle(&self, position: &DeliveryPosition) -> Result<(), BrokerError>;

    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), BrokerError>;

    fn pause(&self);

    fn resume(&self);

    fn is_paused(&self) -> bool;
}

/// Opens consumer sessions on a named source; called again after every
/// connection loss.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        source: &str,
        max_in_flight: usize,
    ) -> Result<Arc<dyn ConsumerSession>, BrokerError>;
}
