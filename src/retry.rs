//! Bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given number of consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        // base * 2^(failures-1), exponent capped at 2^16
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Retrying gave up: either the budget ran out or the error was not retryable.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    retry_with_hint(policy, should_retry, |_| None, op).await
}

/// Like [`retry`], but an error may ask for a longer wait (a `Retry-After`
/// header, say). The wait is the larger of the backoff and the hint, with
/// the hint capped at `max_delay`.
pub async fn retry_with_hint<T, E, F, Fut, P, H>(
    policy: &RetryPolicy,
    should_retry: P,
    hint: H,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    H: Fn(&E) -> Option<Duration>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && should_retry(&err) => {
                let backoff = policy.delay_for(attempt);
                let delay = match hint(&err) {
                    Some(wait) => backoff.max(wait.min(policy.max_delay)),
                    None => backoff,
                };
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Err(Exhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }
        }
    }
}
