use anyhow::{anyhow, Result};
use rand::Rng;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// How the delay between attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffSchedule {
    /// Doubles from `initial` up to `max`.
    Exponential { initial: Duration, max: Duration },
    /// Draws a fresh delay uniformly from `[min, max]` before every retry.
    Uniform { min: Duration, max: Duration },
}

impl BackoffSchedule {
    fn first(&self) -> Duration {
        match *self {
            BackoffSchedule::Exponential { initial, .. } => initial,
            BackoffSchedule::Uniform { min, max } => jittered(min, max),
        }
    }

    fn next(&self, current: Duration) -> Duration {
        match *self {
            BackoffSchedule::Exponential { max, .. } => next_backoff(current, max),
            BackoffSchedule::Uniform { min, max } => jittered(min, max),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff {
    pub schedule: BackoffSchedule,
    pub max_attempts: Option<usize>,
}

impl RetryBackoff {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::with_schedule(BackoffSchedule::Exponential {
            initial: initial_delay,
            max: max_delay,
        })
    }

    pub(crate) fn uniform(min: Duration, max: Duration) -> Self {
        Self::with_schedule(BackoffSchedule::Uniform { min, max })
    }

    pub(crate) fn with_schedule(schedule: BackoffSchedule) -> Self {
        Self {
            schedule,
            max_attempts: None,
        }
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, `classify_error` aborts, or the
/// attempt budget is spent. `on_retry` sees every failure that was eligible
/// for retry, with `will_retry = false` on the last one.
pub(crate) async fn retry_with_backoff<T, F, Fut, L, C>(
    config: RetryBackoff,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
    C: FnMut(usize, &anyhow::Error) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = config.schedule.first();

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify_error(attempt, &err) {
                RetryDisposition::Abort => return Err(err),
                RetryDisposition::Retry => {
                    let exhausted = config
                        .max_attempts
                        .map(|max| attempt >= max)
                        .unwrap_or(false);

                    on_retry(attempt, backoff, &err, !exhausted);

                    if exhausted {
                        return Err(err);
                    }

                    sleep_with_cancellation(backoff, None).await?;
                    backoff = config.schedule.next(backoff);
                }
            },
        }
    }
}

pub(crate) async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => Err(anyhow!("retry cancelled")),
            _ = sleep(delay) => Ok(()),
        }
    } else {
        sleep(delay).await;
        Ok(())
    }
}

/// Uniformly random duration in `[min, max]`.
pub fn jittered(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_backoff {
        next = max_backoff;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicUsize::new(0);
        let mut retries = Vec::new();
        let value = retry_with_backoff(
            RetryBackoff::new(Duration::ZERO, Duration::ZERO).with_max_attempts(5),
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(anyhow!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |attempt, _, _, will_retry| retries.push((attempt, will_retry)),
            |_, _| RetryDisposition::Retry,
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![(1, true), (2, true)]);
    }

    #[tokio::test]
    async fn stops_after_max_attempts_and_on_abort() {
        let mut last = None;
        let err = retry_with_backoff(
            RetryBackoff::new(Duration::ZERO, Duration::ZERO).with_max_attempts(2),
            |_| async { Err::<(), _>(anyhow!("always")) },
            |attempt, _, _, will_retry| last = Some((attempt, will_retry)),
            |_, _| RetryDisposition::Retry,
        )
        .await
        .unwrap_err();
        assert_eq!(format!("{err}"), "always");
        assert_eq!(last, Some((2, false)));

        let calls = AtomicUsize::new(0);
        let _ = retry_with_backoff(
            RetryBackoff::new(Duration::ZERO, Duration::ZERO),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow!("fatal")) }
            },
            |_, _, _, _| {},
            |_, _| RetryDisposition::Abort,
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_sleep() {
        let token = CancellationToken::new();
        token.cancel();
        let err = sleep_with_cancellation(Duration::from_secs(60), Some(&token))
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("cancelled"));
    }

    #[test]
    fn jitter_stays_in_range() {
        let min = Duration::from_millis(1000);
        let max = Duration::from_millis(3000);
        for _ in 0..100 {
            let delay = jittered(min, max);
            assert!(delay >= min && delay <= max);
        }
        assert_eq!(jittered(max, min), max);
    }

    #[test]
    fn exponential_schedule_caps() {
        let schedule = BackoffSchedule::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(250),
        };
        let second = schedule.next(schedule.first());
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(schedule.next(second), Duration::from_millis(250));
    }
}
