//! # Retry with exponential backoff
//! Wraps one async operation. Failed attempts wait `min(base · 2^attempt, max)` before the
//! next call. A predicate can mark errors as final, and an observer sees every scheduled retry.
//! Once the retry budget is spent the last error goes back to the caller unchanged.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total calls are at most `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt + 1` (attempt is zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

type Predicate<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;
type Observer<'a, E> = Box<dyn Fn(&E, u32, Duration) + Send + Sync + 'a>;

/// Configured retry runner.
///
/// ```ignore
/// let body = Retry::new(RetryPolicy::new(3, 1_000))
///     .when(|e: &FetchError| e.is_transient())
///     .on_retry(|e, n, d| tracing::warn!(error = %e, attempt = n, delay_ms = d.as_millis() as u64, "retrying"))
///     .run(|| fetch(url))
///     .await?;
/// ```
pub struct Retry<'a, E> {
    policy: RetryPolicy,
    should_retry: Option<Predicate<'a, E>>,
    on_retry: Option<Observer<'a, E>>,
}

impl<'a, E> Retry<'a, E> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            should_retry: None,
            on_retry: None,
        }
    }

    /// Errors for which `pred` returns false fail immediately.
    pub fn when(mut self, pred: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.should_retry = Some(Box::new(pred));
        self
    }

    /// Called with `(error, retry_number, delay)` before each sleep; retry numbers start at 1.
    pub fn on_retry(mut self, cb: impl Fn(&E, u32, Duration) + Send + Sync + 'a) -> Self {
        self.on_retry = Some(Box::new(cb));
        self
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let retryable = self.should_retry.as_ref().map_or(true, |p| p(&e));
                    if attempt >= self.policy.max_retries || !retryable {
                        return Err(e);
                    }
                    let delay = self.policy.delay_for(attempt);
                    if let Some(cb) = &self.on_retry {
                        cb(&e, attempt + 1, delay);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
