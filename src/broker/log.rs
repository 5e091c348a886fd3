//! Partitioned-log binding: deliveries carry `topic/partition/offset`, and
//! settling commits `offset + 1` once every earlier delivered offset on the
//! same partition has settled too.

use super::error::BrokerError;
use super::session::{Broker, ConsumerSession, Delivery};
use crate::domain::DeliveryPosition;
use crate::runtime::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const DEFAULT_COMMIT_RETRIES: usize = 3;
pub const DEFAULT_COMMIT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// A consumer-group membership on one topic.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Next record from any unpaused partition, resuming from committed offsets.
    async fn poll(&self) -> Result<Option<LogRecord>, BrokerError>;

    /// Records `next_offset` as the group's resume point for `partition`.
    async fn commit(&self, partition: i32, next_offset: i64) -> Result<(), BrokerError>;

    fn pause(&self);

    fn resume(&self);
}

/// Wire client for a partitioned log broker.
#[async_trait]
pub trait LogTransport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn LogConsumer>, BrokerError>;

    async fn produce(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

#[derive(Clone)]
pub struct LogBroker {
    transport: Arc<dyn LogTransport>,
    commit_retries: usize,
    commit_backoff: Duration,
}

impl LogBroker {
    pub fn new(transport: Arc<dyn LogTransport>) -> Self {
        Self {
            transport,
            commit_retries: DEFAULT_COMMIT_RETRIES,
            commit_backoff: DEFAULT_COMMIT_BACKOFF,
        }
    }

    pub fn with_commit_retry(mut self, retries: usize, backoff: Duration) -> Self {
        self.commit_retries = retries;
        self.commit_backoff = backoff;
        self
    }
}

#[async_trait]
impl Broker for LogBroker {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn connect(
        &self,
        source: &str,
        _max_in_flight: usize,
    ) -> Result<Arc<dyn ConsumerSession>, BrokerError> {
        let consumer = self.transport.subscribe(source).await?;
        tracing::info!(topic = source, "subscribed to log topic");
        Ok(Arc::new(LogSession {
            topic: source.to_string(),
            consumer,
            transport: self.transport.clone(),
            partitions: Mutex::new(HashMap::new()),
            commits: tokio::sync::Mutex::new(()),
            paused: AtomicBool::new(false),
            commit_retries: self.commit_retries,
            commit_backoff: self.commit_backoff,
        }))
    }
}

/// Per-partition settle bookkeeping.
#[derive(Debug, Default)]
struct Watermark {
    /// Delivered but not yet settled.
    pending: BTreeSet<i64>,
    highest_delivered: Option<i64>,
    committed: Option<i64>,
}

impl Watermark {
    /// The offset the group may resume from: the lowest unsettled offset, or
    /// one past the highest delivered when nothing is outstanding.
    fn resume_point(&self) -> Option<i64> {
        match self.pending.first() {
            Some(lowest) => Some(*lowest),
            None => self.highest_delivered.map(|offset| offset + 1),
        }
    }
}

pub(crate) struct LogSession {
    topic: String,
    consumer: Box<dyn LogConsumer>,
    transport: Arc<dyn LogTransport>,
    partitions: Mutex<HashMap<i32, Watermark>>,
    /// Serializes commits so a retried older offset never lands after a newer one.
    commits: tokio::sync::Mutex<()>,
    paused: AtomicBool,
    commit_retries: usize,
    commit_backoff: Duration,
}

impl LogSession {
    async fn commit_with_retry(&self, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
        let result = retry_with_backoff(
            RetryBackoff::new(self.commit_backoff, self.commit_backoff * 4)
                .with_max_attempts(self.commit_retries.max(1)),
            |_| async {
                self.consumer
                    .commit(partition, next_offset)
                    .await
                    .map_err(anyhow::Error::new)
            },
            |attempt, backoff, err, will_retry| {
                tracing::warn!(
                    topic = %self.topic,
                    partition,
                    offset = next_offset,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    will_retry,
                    error = %err,
                    "offset commit failed"
                );
            },
            |_, err| match err.downcast_ref::<BrokerError>() {
                Some(BrokerError::Connection(_)) | Some(BrokerError::Closed) => {
                    RetryDisposition::Abort
                }
                _ => RetryDisposition::Retry,
            },
        )
        .await;

        result.map_err(|err| match err.downcast::<BrokerError>() {
            Ok(err) => err,
            Err(other) => BrokerError::Settle(other.to_string()),
        })
    }
}

#[async_trait]
impl ConsumerSession for LogSession {
    async fn next(&self) -> Result<Option<Delivery>, BrokerError> {
        let Some(record) = self.consumer.poll().await? else {
            return Ok(None);
        };

        {
            let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
            let watermark = partitions.entry(record.partition).or_default();
            watermark.pending.insert(record.offset);
            watermark.highest_delivered = Some(
                watermark
                    .highest_delivered
                    .map_or(record.offset, |high| high.max(record.offset)),
            );
        }

        Ok(Some(Delivery {
            position: DeliveryPosition::Log {
                topic: self.topic.clone(),
                partition: record.partition,
                offset: record.offset,
            },
            payload: record.payload,
        }))
    }

    async fn settle(&self, position: &DeliveryPosition) -> Result<(), BrokerError> {
        let DeliveryPosition::Log {
            partition, offset, ..
        } = position
        else {
            return Err(BrokerError::Settle(format!(
                "log session cannot settle {position:?}"
            )));
        };

        {
            let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(watermark) = partitions.get_mut(partition) else {
                return Ok(());
            };
            let was_lowest = watermark.pending.first() == Some(offset);
            if !watermark.pending.remove(offset) {
                tracing::debug!(partition, offset, "delivery already settled");
                return Ok(());
            }
            if !was_lowest {
                return Ok(());
            }
        }

        let _commit = self.commits.lock().await;
        let target = {
            let partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(watermark) = partitions.get(partition) else {
                return Ok(());
            };
            match watermark.resume_point() {
                Some(next) if watermark.committed.map_or(true, |done| next > done) => next,
                _ => return Ok(()),
            }
        };

        self.commit_with_retry(*partition, target).await?;

        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(watermark) = partitions.get_mut(partition) {
            if watermark.committed.map_or(true, |done| target > done) {
                watermark.committed = Some(target);
            }
        }
        tracing::debug!(topic = %self.topic, partition, offset = target, "offset committed");
        Ok(())
    }

    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.transport.produce(destination, payload).await
    }

    fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.consumer.pause();
            tracing::debug!(topic = %self.topic, "log consumer paused");
        }
    }

    fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.consumer.resume();
            tracing::debug!(topic = %self.topic, "log consumer resumed");
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}
