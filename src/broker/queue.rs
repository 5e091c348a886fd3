//! Queue binding: deliveries carry a delivery tag; settling acks it.
//! Anything left unacked when a channel goes away is redelivered.

use super::error::BrokerError;
use super::session::{Broker, ConsumerSession, Delivery};
use crate::domain::DeliveryPosition;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDelivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// An open channel consuming one queue with a prefetch window.
#[async_trait]
pub trait QueueChannel: Send + Sync {
    async fn receive(&self) -> Result<Option<QueueDelivery>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Stops handing out deliveries until `resume`.
    fn pause(&self);

    fn resume(&self);
}

/// Wire client for a queue broker.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn open(&self, queue: &str, prefetch: usize) -> Result<Box<dyn QueueChannel>, BrokerError>;
}

#[derive(Clone)]
pub struct QueueBroker {
    transport: Arc<dyn QueueTransport>,
}

impl QueueBroker {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Broker for QueueBroker {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn connect(
        &self,
        source: &str,
        max_in_flight: usize,
    ) -> Result<Arc<dyn ConsumerSession>, BrokerError> {
        let prefetch = max_in_flight.max(1);
        let channel = self.transport.open(source, prefetch).await?;
        tracing::info!(queue = source, prefetch, "consuming from queue");
        Ok(Arc::new(QueueSession {
            queue: source.to_string(),
            channel,
            unacked: Mutex::new(HashSet::new()),
            paused: AtomicBool::new(false),
        }))
    }
}

pub(crate) struct QueueSession {
    queue: String,
    channel: Box<dyn QueueChannel>,
    unacked: Mutex<HashSet<u64>>,
    paused: AtomicBool,
}

#[async_trait]
impl ConsumerSession for QueueSession {
    async fn next(&self) -> Result<Option<Delivery>, BrokerError> {
        let Some(delivery) = self.channel.receive().await? else {
            return Ok(None);
        };
        if delivery.redelivered {
            tracing::debug!(queue = %self.queue, tag = delivery.delivery_tag, "redelivered message");
        }
        self.unacked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(delivery.delivery_tag);
        Ok(Some(Delivery {
            position: DeliveryPosition::Queue {
                delivery_tag: delivery.delivery_tag,
            },
            payload: delivery.payload,
        }))
    }

    async fn settle(&self, position: &DeliveryPosition) -> Result<(), BrokerError> {
        let DeliveryPosition::Queue { delivery_tag } = position else {
            return Err(BrokerError::Settle(format!(
                "queue session cannot settle {position:?}"
            )));
        };
        let first_settle = self
            .unacked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(delivery_tag);
        if !first_settle {
            tracing::debug!(tag = delivery_tag, "delivery already settled");
            return Ok(());
        }
        self.channel.ack(*delivery_tag).await
    }

    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.channel.publish(destination, payload).await
    }

    fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.channel.pause();
            tracing::debug!(queue = %self.queue, "queue consumer paused");
        }
    }

    fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.channel.resume();
            tracing::debug!(queue = %self.queue, "queue consumer resumed");
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}
