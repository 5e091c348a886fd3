use crate::broker::error::BrokerError;
use crate::broker::queue::{QueueChannel, QueueDelivery, QueueTransport};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Named queues held in memory. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    state: Mutex<QueueState>,
    changed: Notify,
}

#[derive(Default)]
struct QueueState {
    ready: HashMap<String, VecDeque<Ready>>,
    unacked: BTreeMap<u64, Unacked>,
    next_tag: u64,
    next_channel: u64,
    epoch: u64,
    closed: bool,
    fail_connects: usize,
    fail_publishes: usize,
    ack_calls: usize,
}

struct Ready {
    payload: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    channel: u64,
    queue: String,
    payload: Vec<u8>,
}

impl QueueState {
    /// Puts the matching unacked deliveries back at the head of their queues
    /// in their original order.
    fn requeue(&mut self, mut belongs: impl FnMut(&Unacked) -> bool) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| belongs(unacked))
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.ready
                    .entry(unacked.queue)
                    .or_default()
                    .push_front(Ready {
                        payload: unacked.payload,
                        redelivered: true,
                    });
            }
        }
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, queue: &str, payload: &[u8]) {
        self.inner
            .lock()
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_back(Ready {
                payload: payload.to_vec(),
                redelivered: false,
            });
        self.inner.changed.notify_waiters();
    }

    /// Payloads waiting in `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .ready
            .get(queue)
            .map(|ready| ready.iter().map(|msg| msg.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.inner.lock().ready.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked_len(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    pub fn ack_calls(&self) -> usize {
        self.inner.lock().ack_calls
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.inner.lock().fail_connects = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.lock().fail_publishes = count;
    }

    /// Kills every open channel and requeues what they held.
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.requeue(|_| true);
        }
        self.inner.changed.notify_waiters();
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.changed.notify_waiters();
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn open(&self, queue: &str, prefetch: usize) -> Result<Box<dyn QueueChannel>, BrokerError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        state.next_channel += 1;
        state.ready.entry(queue.to_string()).or_default();
        Ok(Box::new(MemoryChannel {
            broker: self.inner.clone(),
            id: state.next_channel,
            queue: queue.to_string(),
            prefetch: prefetch.max(1),
            epoch: state.epoch,
            paused: AtomicBool::new(false),
        }))
    }
}

struct MemoryChannel {
    broker: Arc<QueueInner>,
    id: u64,
    queue: String,
    prefetch: usize,
    epoch: u64,
    paused: AtomicBool,
}

impl MemoryChannel {
    fn check_alive(&self, state: &QueueState) -> Result<(), BrokerError> {
        if state.epoch != self.epoch {
            return Err(BrokerError::Connection("channel closed by broker".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn receive(&self) -> Result<Option<QueueDelivery>, BrokerError> {
        loop {
            let notified = self.broker.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.broker.lock();
                if state.closed {
                    return Ok(None);
                }
                self.check_alive(&state)?;

                let in_flight = state
                    .unacked
                    .values()
                    .filter(|unacked| unacked.channel == self.id)
                    .count();
                if !self.paused.load(Ordering::SeqCst) && in_flight < self.prefetch {
                    let next = state
                        .ready
                        .get_mut(&self.queue)
                        .and_then(VecDeque::pop_front);
                    if let Some(ready) = next {
                        state.next_tag += 1;
                        let delivery_tag = state.next_tag;
                        state.unacked.insert(
                            delivery_tag,
                            Unacked {
                                channel: self.id,
                                queue: self.queue.clone(),
                                payload: ready.payload.clone(),
                            },
                        );
                        return Ok(Some(QueueDelivery {
                            delivery_tag,
                            payload: ready.payload,
                            redelivered: ready.redelivered,
                        }));
                    }
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.lock();
            self.check_alive(&state)?;
            match state.unacked.get(&delivery_tag) {
                Some(unacked) if unacked.channel == self.id => {
                    state.unacked.remove(&delivery_tag);
                    state.ack_calls += 1;
                }
                _ => {
                    return Err(BrokerError::Settle(format!(
                        "unknown delivery tag {delivery_tag}"
                    )))
                }
            }
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.lock();
            self.check_alive(&state)?;
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(BrokerError::Publish(format!("{queue} rejected the message")));
            }
            state
                .ready
                .entry(queue.to_string())
                .or_default()
                .push_back(Ready {
                    payload: payload.to_vec(),
                    redelivered: false,
                });
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.broker.changed.notify_waiters();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let id = self.id;
        self.broker.lock().requeue(|unacked| unacked.channel == id);
        self.broker.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_requeues_in_order() {
        let broker = MemoryQueue::new();
        broker.push("q", b"1");
        broker.push("q", b"2");
        broker.push("q", b"3");
        let channel = broker.open("q", 10).await.unwrap();
        channel.receive().await.unwrap().unwrap();
        channel.receive().await.unwrap().unwrap();

        broker.disconnect();
        assert!(matches!(
            channel.receive().await,
            Err(BrokerError::Connection(_))
        ));
        assert_eq!(
            broker.ready_messages("q"),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );

        let channel = broker.open("q", 10).await.unwrap();
        let first = channel.receive().await.unwrap().unwrap();
        assert!(first.redelivered);
        assert_eq!(first.payload, b"1".to_vec());
    }

    #[tokio::test]
    async fn refused_connections_are_counted_down() {
        let broker = MemoryQueue::new();
        broker.fail_next_connects(2);
        assert!(broker.open("q", 1).await.is_err());
        assert!(broker.open("q", 1).await.is_err());
        assert!(broker.open("q", 1).await.is_ok());
    }

    #[tokio::test]
    async fn foreign_tags_are_rejected() {
        let broker = MemoryQueue::new();
        broker.push("q", b"1");
        let a = broker.open("q", 1).await.unwrap();
        let b = broker.open("q", 1).await.unwrap();
        let delivery = a.receive().await.unwrap().unwrap();
        assert!(matches!(
            b.ack(delivery.delivery_tag).await,
            Err(BrokerError::Settle(_))
        ));
        a.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_len(), 0);
    }
}
