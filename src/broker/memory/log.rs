use crate::broker::error::BrokerError;
use crate::broker::log::{LogConsumer, LogRecord, LogTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Partitioned log held in memory. Clones share the same log.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    state: Mutex<LogState>,
    changed: Notify,
}

#[derive(Default)]
struct LogState {
    partitions: i32,
    topics: HashMap<String, Vec<Vec<Vec<u8>>>>,
    committed: HashMap<(String, i32), i64>,
    /// Bumped on `disconnect`; consumers from older epochs are dead.
    epoch: u64,
    closed: bool,
    next_partition: i32,
    fail_connects: usize,
    fail_commits: usize,
    fail_publishes: usize,
    commit_calls: usize,
    pause_calls: usize,
}

impl LogState {
    fn topic_mut(&mut self, topic: &str) -> &mut Vec<Vec<Vec<u8>>> {
        let partitions = self.partitions as usize;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }
}

impl LogInner {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryLog {
    pub fn new(partitions: i32) -> Self {
        Self {
            inner: Arc::new(LogInner {
                state: Mutex::new(LogState {
                    partitions: partitions.max(1),
                    ..LogState::default()
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Appends to one partition and returns the record's offset.
    pub fn append(&self, topic: &str, partition: i32, payload: &[u8]) -> i64 {
        let offset = {
            let mut state = self.inner.lock();
            let partition = partition.clamp(0, state.partitions - 1) as usize;
            let records = &mut state.topic_mut(topic)[partition];
            records.push(payload.to_vec());
            records.len() as i64 - 1
        };
        self.inner.changed.notify_waiters();
        offset
    }

    /// Every record of `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .lock()
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    pub fn commit_calls(&self) -> usize {
        self.inner.lock().commit_calls
    }

    pub fn pause_calls(&self) -> usize {
        self.inner.lock().pause_calls
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.inner.lock().fail_connects = count;
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.inner.lock().fail_commits = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.lock().fail_publishes = count;
    }

    /// Drops every live consumer; their next call fails with a connection error.
    pub fn disconnect(&self) {
        self.inner.lock().epoch += 1;
        self.inner.changed.notify_waiters();
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.changed.notify_waiters();
    }
}

#[async_trait]
impl LogTransport for MemoryLog {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn LogConsumer>, BrokerError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        state.topic_mut(topic);
        Ok(Box::new(MemoryLogConsumer {
            log: self.inner.clone(),
            topic: topic.to_string(),
            epoch: state.epoch,
            cursor: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
        }))
    }

    async fn produce(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let partition = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(BrokerError::Publish(format!("{topic} rejected the record")));
            }
            let partition = state.next_partition;
            state.next_partition = (partition + 1) % state.partitions;
            partition
        };
        self.append(topic, partition, payload);
        Ok(())
    }
}

struct MemoryLogConsumer {
    log: Arc<LogInner>,
    topic: String,
    epoch: u64,
    /// Next offset to hand out per partition.
    cursor: Mutex<HashMap<i32, i64>>,
    paused: AtomicBool,
}

impl MemoryLogConsumer {
    fn take_next(&self, state: &LogState) -> Option<LogRecord> {
        let partitions = state.topics.get(&self.topic)?;
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, records) in partitions.iter().enumerate() {
            let partition = index as i32;
            let next = *cursor.entry(partition).or_insert_with(|| {
                state
                    .committed
                    .get(&(self.topic.clone(), partition))
                    .copied()
                    .unwrap_or(0)
            });
            if let Some(payload) = records.get(next as usize) {
                cursor.insert(partition, next + 1);
                return Some(LogRecord {
                    partition,
                    offset: next,
                    payload: payload.clone(),
                });
            }
        }
        None
    }
}

#[async_trait]
impl LogConsumer for MemoryLogConsumer {
    async fn poll(&self) -> Result<Option<LogRecord>, BrokerError> {
        loop {
            let notified = self.log.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.log.lock();
                if state.closed {
                    return Ok(None);
                }
                if state.epoch != self.epoch {
                    return Err(BrokerError::Connection("connection reset".to_string()));
                }
                if !self.paused.load(Ordering::SeqCst) {
                    if let Some(record) = self.take_next(&state) {
                        return Ok(Some(record));
                    }
                }
            }

            notified.await;
        }
    }

    async fn commit(&self, partition: i32, next_offset: i64) -> Result<(), BrokerError> {
        let mut state = self.log.lock();
        if state.epoch != self.epoch {
            return Err(BrokerError::Connection("connection reset".to_string()));
        }
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(BrokerError::Settle("commit rejected".to_string()));
        }
        state.commit_calls += 1;
        state
            .committed
            .insert((self.topic.clone(), partition), next_offset);
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.log.lock().pause_calls += 1;
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.log.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_kills_live_consumers() {
        let log = MemoryLog::new(2);
        let consumer = log.subscribe("t").await.unwrap();
        log.produce("t", b"x").await.unwrap();
        assert!(consumer.poll().await.unwrap().is_some());

        log.disconnect();
        assert!(matches!(
            consumer.poll().await,
            Err(BrokerError::Connection(_))
        ));
        assert!(log.subscribe("t").await.is_ok());
    }

    #[tokio::test]
    async fn produce_spreads_across_partitions() {
        let log = MemoryLog::new(2);
        log.produce("t", b"a").await.unwrap();
        log.produce("t", b"b").await.unwrap();
        let consumer = log.subscribe("t").await.unwrap();
        let first = consumer.poll().await.unwrap().unwrap();
        let second = consumer.poll().await.unwrap().unwrap();
        assert_eq!((first.partition, first.offset), (0, 0));
        assert_eq!((second.partition, second.offset), (1, 0));
        assert_eq!(log.records("t"), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn close_ends_polling() {
        let log = MemoryLog::new(1);
        let consumer = log.subscribe("t").await.unwrap();
        log.close();
        assert_eq!(consumer.poll().await, Ok(None));
        assert!(matches!(log.subscribe("t").await, Err(BrokerError::Closed)));
    }
}
