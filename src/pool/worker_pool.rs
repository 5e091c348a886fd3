//! Worker pool state machine.
//!
//! Every mutation of the member, idle, and timer sets happens under one
//! `std::sync::Mutex` and never across an `.await`; worker creation,
//! initialisation, execution, and destruction all run outside the lock.
//! Invariant: `members + creating <= max_pool_size`, so the number of lent
//! workers can never exceed the configured bound.

use super::activity::{ActivityGuard, ActivityTracker};
use super::lease::WorkerLease;
use crate::fetch::{FetchWorker, WorkerFactory, WorkerId};
use crate::runtime::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use crate::runtime::telemetry::Telemetry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub const DEFAULT_MAX_POOL_SIZE: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_INIT_ATTEMPTS: usize = 3;
pub const DEFAULT_INIT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    /// How long a worker may sit idle before it is destroyed.
    pub idle_timeout: Duration,
    /// Create-and-init attempts before `acquire` gives up.
    pub init_attempts: usize,
    pub init_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            init_attempts: DEFAULT_INIT_ATTEMPTS,
            init_backoff: DEFAULT_INIT_BACKOFF,
        }
    }
}

#[derive(Debug)]
pub enum PoolError {
    Closed,
    WorkerInit {
        attempts: usize,
        source: anyhow::Error,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Closed => write!(f, "worker pool is closed"),
            PoolError::WorkerInit { attempts, source } => {
                write!(f, "failed to start a fetch worker after {attempts} attempts: {source}")
            }
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Closed => None,
            PoolError::WorkerInit { source, .. } => Some(source.as_ref()),
        }
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub members: usize,
    pub available: usize,
    pub lent: usize,
    pub creating: usize,
    pub waiting: usize,
    pub paused: bool,
}

/// Cloneable handle to a shared pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn WorkerFactory>,
    pub(super) telemetry: Arc<Telemetry>,
    state: Mutex<PoolState>,
    capacity: Notify,
    paused: watch::Sender<bool>,
    pub(super) activity: Arc<ActivityTracker>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    members: HashMap<WorkerId, Arc<dyn FetchWorker>>,
    /// Idle workers, most recently released last.
    available: Vec<WorkerId>,
    idle_timers: HashMap<WorkerId, IdleTimer>,
    creating: usize,
    waiting: usize,
    closed: bool,
    timer_generation: u64,
}

struct IdleTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn WorkerFactory>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let config = PoolConfig {
            max_pool_size: config.max_pool_size.max(1),
            init_attempts: config.init_attempts.max(1),
            ..config
        };
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                telemetry,
                state: Mutex::new(PoolState::default()),
                capacity: Notify::new(),
                paused,
                activity: Arc::new(ActivityTracker::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Lends a worker, creating one lazily while under capacity.
    ///
    /// When every slot is lent the caller waits for a release; while it
    /// waits the backpressure signal reads `true`.
    pub async fn acquire(&self) -> Result<WorkerLease, PoolError> {
        let mut waiter: Option<WaitGuard> = None;

        let slot = loop {
            let notified = self.inner.capacity.notified();
            tokio::pin!(notified);

            {
                let mut state = self.inner.lock_state();
                if state.closed {
                    if let Some(guard) = waiter.take() {
                        state.waiting = state.waiting.saturating_sub(1);
                        guard.disarm();
                        self.inner.sync_backpressure(&state);
                    }
                    return Err(PoolError::Closed);
                }

                if let Some(worker) = state.take_available() {
                    if let Some(guard) = waiter.take() {
                        state.waiting = state.waiting.saturating_sub(1);
                        guard.disarm();
                        self.inner.sync_backpressure(&state);
                    }
                    drop(state);
                    return Ok(WorkerLease::new(worker, self.inner.clone()));
                }

                if state.members.len() + state.creating < self.inner.config.max_pool_size {
                    state.creating += 1;
                    if let Some(guard) = waiter.take() {
                        state.waiting = state.waiting.saturating_sub(1);
                        guard.disarm();
                        self.inner.sync_backpressure(&state);
                    }
                    break CreationSlot::new(self.inner.clone());
                }

                if waiter.is_none() {
                    state.waiting += 1;
                    waiter = Some(WaitGuard::new(self.inner.clone()));
                }
                self.inner.sync_backpressure(&state);
                notified.as_mut().enable();
            }

            notified.await;
        };

        let worker = self.inner.create_worker().await?;
        slot.fill(worker)
    }

    /// Registers one in-flight unit of processing; `close` waits for all of them.
    pub fn track(&self) -> ActivityGuard {
        self.inner.activity.enter()
    }

    /// Receiver that reads `true` while callers are blocked on a saturated pool.
    pub fn backpressure(&self) -> watch::Receiver<bool> {
        self.inner.paused.subscribe()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        PoolStats {
            members: state.members.len(),
            available: state.available.len(),
            lent: state.members.len() - state.available.len(),
            creating: state.creating,
            waiting: state.waiting,
            paused: *self.inner.paused.borrow(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Waits for in-flight processing to finish, then destroys every member.
    /// Calling it again is harmless.
    pub async fn close(&self) {
        let first_close = {
            let mut state = self.inner.lock_state();
            !std::mem::replace(&mut state.closed, true)
        };
        self.inner.capacity.notify_waiters();

        self.inner
            .activity
            .wait_until_idle_with(|| async {
                tracing::debug!(
                    active = self.inner.activity.active(),
                    "waiting for in-flight work before closing pool"
                );
            })
            .await;

        let workers: Vec<Arc<dyn FetchWorker>> = {
            let mut state = self.inner.lock_state();
            for (_, timer) in state.idle_timers.drain() {
                timer.handle.abort();
            }
            state.available.clear();
            state.members.drain().map(|(_, worker)| worker).collect()
        };

        let count = workers.len();
        for worker in workers {
            worker.destroy().await;
            self.inner.telemetry.record_worker_destroyed(0, false);
        }
        self.inner.set_paused(false);

        if first_close {
            tracing::info!(destroyed = count, "worker pool closed");
        }
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_paused(&self, paused: bool) {
        let changed = self.paused.send_if_modified(|current| {
            if *current == paused {
                false
            } else {
                *current = paused;
                true
            }
        });
        if changed {
            if paused {
                self.telemetry.record_backpressure_pause();
                tracing::debug!("worker pool saturated; pausing intake");
            } else {
                tracing::debug!("worker pool has capacity; resuming intake");
            }
        }
    }

    /// Pause tracks whether any caller is blocked. Called with the state lock
    /// held so concurrent waiters cannot publish a stale value.
    fn sync_backpressure(&self, state: &PoolState) {
        self.set_paused(state.waiting > 0);
    }

    /// Wakes one blocked caller. Intake stays paused until no caller waits.
    fn signal_capacity(&self) {
        self.sync_backpressure(&self.lock_state());
        self.capacity.notify_one();
    }

    async fn create_worker(&self) -> Result<Arc<dyn FetchWorker>, PoolError> {
        let attempts = self.config.init_attempts;
        retry_with_backoff(
            RetryBackoff::new(self.config.init_backoff, self.config.init_backoff * 4)
                .with_max_attempts(attempts),
            |_| async {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let worker = self.factory.build(id)?;
                if let Err(err) = worker.init().await {
                    worker.destroy().await;
                    return Err(err);
                }
                Ok(worker)
            },
            |attempt, backoff, err, will_retry| {
                tracing::warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    will_retry,
                    error = %err,
                    "fetch worker failed to start"
                );
            },
            |_, _| RetryDisposition::Retry,
        )
        .await
        .map_err(|source| PoolError::WorkerInit { attempts, source })
    }

    pub(super) fn release_worker(self: &Arc<Self>, worker: &Arc<dyn FetchWorker>) {
        let id = worker.id();
        {
            let mut state = self.lock_state();
            if !state.members.contains_key(&id) || state.available.contains(&id) {
                return;
            }
            state.available.push(id);
            self.arm_idle_timer(&mut state, id);
        }
        self.signal_capacity();
    }

    pub(super) async fn discard_worker(&self, worker: Arc<dyn FetchWorker>) {
        let id = worker.id();
        let removed = {
            let mut state = self.lock_state();
            if let Some(timer) = state.idle_timers.remove(&id) {
                timer.handle.abort();
            }
            state.available.retain(|member| *member != id);
            state.members.remove(&id).map(|_| state.members.len())
        };

        worker.destroy().await;
        if let Some(size) = removed {
            self.telemetry.record_worker_destroyed(size, false);
            tracing::debug!(worker = id, pool_size = size, "discarded fetch worker");
        }
        self.signal_capacity();
    }

    fn arm_idle_timer(self: &Arc<Self>, state: &mut PoolState, id: WorkerId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let pool = Arc::downgrade(self);
        let idle_timeout = self.config.idle_timeout;
        let handle = runtime.spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            if let Some(pool) = pool.upgrade() {
                pool.evict_idle(id, generation).await;
            }
        });
        if let Some(previous) = state.idle_timers.insert(id, IdleTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    async fn evict_idle(&self, id: WorkerId, generation: u64) {
        let evicted = {
            let mut state = self.lock_state();
            match state.idle_timers.get(&id) {
                Some(timer) if timer.generation == generation => {}
                _ => return,
            }
            state.idle_timers.remove(&id);
            let Some(position) = state.available.iter().position(|member| *member == id) else {
                return;
            };
            state.available.remove(position);
            state
                .members
                .remove(&id)
                .map(|worker| (worker, state.members.len()))
        };

        if let Some((worker, size)) = evicted {
            worker.destroy().await;
            self.telemetry.record_worker_destroyed(size, true);
            tracing::debug!(worker = id, pool_size = size, "evicted idle fetch worker");
            self.capacity.notify_one();
        }
    }
}

impl PoolState {
    fn take_available(&mut self) -> Option<Arc<dyn FetchWorker>> {
        while let Some(id) = self.available.pop() {
            if let Some(timer) = self.idle_timers.remove(&id) {
                timer.handle.abort();
            }
            if let Some(worker) = self.members.get(&id) {
                return Some(worker.clone());
            }
        }
        None
    }
}

/// Keeps `waiting` accurate if an `acquire` future is dropped while blocked.
struct WaitGuard {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl WaitGuard {
    fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool, armed: true }
    }

    /// Caller already adjusted `waiting` under the lock.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.lock_state();
            state.waiting = state.waiting.saturating_sub(1);
            self.pool.sync_backpressure(&state);
        }
    }
}

/// A reserved creation slot; returned to the pool if creation fails or the
/// acquiring future is dropped.
struct CreationSlot {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl CreationSlot {
    fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool, armed: true }
    }

    fn fill(mut self, worker: Arc<dyn FetchWorker>) -> Result<WorkerLease, PoolError> {
        self.armed = false;
        let pool = self.pool.clone();
        let closed = {
            let mut state = pool.lock_state();
            state.creating = state.creating.saturating_sub(1);
            if !state.closed {
                state.members.insert(worker.id(), worker.clone());
                pool.telemetry.record_worker_created(state.members.len());
                tracing::debug!(
                    worker = worker.id(),
                    pool_size = state.members.len(),
                    "fetch worker created"
                );
            }
            state.closed
        };

        if closed {
            tokio::spawn(async move { worker.destroy().await });
            return Err(PoolError::Closed);
        }
        Ok(WorkerLease::new(worker, pool))
    }
}

impl Drop for CreationSlot {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.pool.lock_state();
                state.creating = state.creating.saturating_sub(1);
            }
            self.pool.capacity.notify_one();
        }
    }
}
