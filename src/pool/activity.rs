use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts in-flight work so shutdown can wait for it to drain.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    active: AtomicUsize,
    notify: Notify,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn enter(self: &Arc<Self>) -> ActivityGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            tracker: Arc::clone(self),
            active: true,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn wait_until_idle_with<F, Fut>(&self, mut on_wait: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }

            let notified = self.notify.notified();
            on_wait().await;

            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}

pub struct ActivityGuard {
    tracker: Arc<ActivityTracker>,
    active: bool,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.active {
            self.tracker.release();
            self.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn waits_for_all_guards() {
        let tracker = Arc::new(ActivityTracker::new());
        let first = tracker.enter();
        let second = tracker.enter();
        assert_eq!(tracker.active(), 2);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_until_idle_with(|| async {}).await })
        };

        drop(first);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(second);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish once idle")
            .unwrap();
    }
}
