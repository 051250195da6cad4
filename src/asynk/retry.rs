//! Opt-in retry helpers for the async-fetch pattern.
//!
//! Nothing in the graph engine retries implicitly; a failed computed
//! stays failed until its inputs change. These helpers wrap the
//! operation itself, typically inside an
//! [`async_computed`](super::async_computed) factory's future.

use std::future::Future;
use std::time::Duration;

/// Exponential backoff schedule with jitter.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. 0 is treated as 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
    /// Upper bound applied after doubling.
    pub max_delay: Duration,
    /// Fraction of the delay randomized away, 0.0..=1.0. A delay of
    /// 100ms with jitter 0.25 sleeps between 75ms and 125ms.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// The sleep before retry number `retry` (0-based: the delay after
    /// the first failure is `delay_before_retry(0)`).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(retry))
            .min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return doubled;
        }
        // Uniform in [1 - jitter, 1 + jitter]
        let factor = 1.0 + jitter * (fastrand::f64() * 2.0 - 1.0);
        doubled.mul_f64(factor)
    }
}

/// Retry a synchronous fallible operation with backoff.
///
/// Returns the first success, or the last error once the policy's
/// attempts are exhausted. Sleeps on the calling thread between
/// attempts.
pub fn retry_sync<T, E, F>(mut op: F, policy: RetryPolicy) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let attempts = policy.max_attempts.max(1);
    let mut retry = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) if retry + 1 >= attempts => return Err(error),
            Err(_) => {
                std::thread::sleep(policy.delay_before_retry(retry));
                retry += 1;
            }
        }
    }
}

/// Retry an async fallible operation with backoff.
///
/// Runtime-agnostic: the caller supplies `sleep`, the timer of whatever
/// executor is driving this future (`tokio::time::sleep`,
/// `futures_timer::Delay`, ...).
///
/// # Example
/// ```ignore
/// let user = retry(
///     || fetch_user(id),
///     |delay| tokio::time::sleep(delay),
///     RetryPolicy::default(),
/// )
/// .await?;
/// ```
pub async fn retry<T, E, F, Fut, S, SleepFut>(
    mut op: F,
    mut sleep: S,
    policy: RetryPolicy,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: FnMut(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
{
    let attempts = policy.max_attempts.max(1);
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if retry + 1 >= attempts => return Err(error),
            Err(_) => {
                sleep(policy.delay_before_retry(retry)).await;
                retry += 1;
            }
        }
    }
}
