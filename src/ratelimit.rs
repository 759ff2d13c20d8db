//! # Token bucket
//! Process-local rate limiter shared by the network-calling adapters.
//!
//! The bucket starts full and refills continuously at `refill_per_sec`. Refill happens lazily
//! on every call, so there is no background timer. `acquire` sleeps in increments of at most
//! one second until enough tokens exist, then debits them.
//!
//! Time is read from `tokio::time::Instant`, which lets tests drive the bucket with a paused
//! runtime clock.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Longest single sleep inside `acquire`.
const MAX_WAIT: Duration = Duration::from_secs(1);
/// Shortest single sleep; keeps float rounding from spinning on zero-length waits.
const MIN_WAIT: Duration = Duration::from_millis(1);
const EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter. Construct one per adapter and share it through an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    max_tokens: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(max_tokens: f64, refill_per_sec: f64) -> Self {
        let max_tokens = if max_tokens.is_finite() && max_tokens > 0.0 {
            max_tokens
        } else {
            1.0
        };
        let refill_per_sec = if refill_per_sec.is_finite() && refill_per_sec > 0.0 {
            refill_per_sec
        } else {
            1.0
        };
        Self {
            max_tokens,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        bucket.last_refill = now;
    }

    /// Block until `n` tokens are available, then debit them.
    ///
    /// Requests larger than the bucket capacity are clamped to the capacity, otherwise they
    /// could never be satisfied. A non-finite request counts as a full bucket.
    pub async fn acquire(&self, n: f64) {
        let n = if n.is_finite() {
            n.clamp(0.0, self.max_tokens)
        } else {
            self.max_tokens
        };
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens + EPSILON >= n {
                    bucket.tokens = (bucket.tokens - n).max(0.0);
                    return;
                }
                let needed = n - bucket.tokens;
                Duration::from_secs_f64(needed / self.refill_per_sec)
                    .min(MAX_WAIT)
                    .max(MIN_WAIT)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Debit `n` tokens only if they are available right now.
    pub async fn try_acquire(&self, n: f64) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens + EPSILON >= n {
            bucket.tokens = (bucket.tokens - n).max(0.0);
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after a lazy refill).
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn starts_full_and_debits() {
        let rl = RateLimiter::new(5.0, 1.0);
        assert!(rl.try_acquire(5.0).await);
        assert!(!rl.try_acquire(1.0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn refills_lazily_with_elapsed_time() {
        let rl = RateLimiter::new(10.0, 2.0);
        rl.acquire(10.0).await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        let avail = rl.available().await;
        assert!((avail - 3.0).abs() < 1e-6, "avail={avail}");
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let rl = RateLimiter::new(3.0, 100.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(rl.available().await <= 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversize_request_is_clamped() {
        let rl = RateLimiter::new(2.0, 1.0);
        let t0 = Instant::now();
        rl.acquire(50.0).await;
        assert_eq!(Instant::now(), t0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_finite_request_takes_the_whole_bucket() {
        let rl = RateLimiter::new(3.0, 1.0);
        let t0 = Instant::now();
        rl.acquire(f64::NAN).await;
        assert_eq!(Instant::now(), t0);
        assert!(rl.available().await < 1e-6);

        rl.acquire(f64::INFINITY).await;
        assert!(Instant::now() - t0 >= Duration::from_secs(3));
    }

    #[test]
    fn degenerate_parameters_are_sanitized() {
        let rl = RateLimiter::new(0.0, f64::NAN);
        assert_eq!(rl.max_tokens(), 1.0);
        assert_eq!(rl.refill_per_sec(), 1.0);
    }
}
