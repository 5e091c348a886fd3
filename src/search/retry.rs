use crate::fetch::{FetchError, FetchRequest, FetchResponse};
use crate::pool::{ExecuteError, FetchExecutor};
use crate::runtime::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_BACKOFF_MIN: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(3);

/// Bounded retry with a uniformly random pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_min: DEFAULT_RETRY_BACKOFF_MIN,
            backoff_max: DEFAULT_RETRY_BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Runs `request` until it succeeds, fails terminally, or the policy is spent.
/// Every failed attempt has already cost its worker, so each retry runs on a
/// fresh one.
pub async fn fetch_with_retry(
    executor: &dyn FetchExecutor,
    request: &FetchRequest,
    policy: &RetryPolicy,
) -> Result<FetchResponse, ExecuteError> {
    let result = retry_with_backoff(
        RetryBackoff::uniform(policy.backoff_min, policy.backoff_max)
            .with_max_attempts(policy.attempts()),
        |_| async { executor.fetch(request).await.map_err(anyhow::Error::new) },
        |attempt, backoff, err, will_retry| {
            tracing::warn!(
                request = request.kind.as_str(),
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                will_retry,
                error = %err,
                "fetch attempt failed"
            );
        },
        |_, err| match err.downcast_ref::<ExecuteError>() {
            Some(err) if err.is_retryable() => RetryDisposition::Retry,
            _ => RetryDisposition::Abort,
        },
    )
    .await;

    result.map_err(|err| match err.downcast::<ExecuteError>() {
        Ok(err) => err,
        Err(other) => ExecuteError::Fetch(FetchError::Network(other.to_string())),
    })
}
