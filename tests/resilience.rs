// tests/resilience.rs
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cryptowire::ratelimit::RateLimiter;
use cryptowire::retry::{Retry, RetryPolicy};

#[tokio::test(start_paused = true)]
async fn retry_succeeds_after_k_failures() {
    for k in 0..3u32 {
        let calls = AtomicU32::new(0);
        let out: Result<&str, String> = Retry::new(RetryPolicy::new(3, 100))
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < k {
                        Err(format!("fail {n}"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), k + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn retry_surfaces_last_error() {
    let calls = AtomicU32::new(0);
    let out: Result<(), String> = Retry::new(RetryPolicy::new(2, 50))
        .run(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("fail {n}")) }
        })
        .await;
    assert_eq!(out.unwrap_err(), "fail 2");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_errors_fail_fast() {
    let calls = AtomicU32::new(0);
    let out: Result<(), u16> = Retry::new(RetryPolicy::new(5, 10))
        .when(|status: &u16| *status >= 500)
        .run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(404) }
        })
        .await;
    assert_eq!(out.unwrap_err(), 404);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn backoff_doubles_and_caps() {
    let p = RetryPolicy::new(5, 1_000).with_max_delay(Duration::from_secs(5));
    assert_eq!(p.delay_for(0), Duration::from_secs(1));
    assert_eq!(p.delay_for(1), Duration::from_secs(2));
    assert_eq!(p.delay_for(2), Duration::from_secs(4));
    assert_eq!(p.delay_for(3), Duration::from_secs(5));
    assert_eq!(p.delay_for(40), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn limiter_never_exceeds_refill_rate() {
    // 4 tokens, refilled at 2/s: after the initial burst, 2 grants per second.
    let limiter = Arc::new(RateLimiter::new(4.0, 2.0));
    let start = tokio::time::Instant::now();
    let mut grants = Vec::new();
    for _ in 0..12 {
        limiter.acquire(1.0).await;
        grants.push(start.elapsed());
    }

    for window_start in 0..6u64 {
        let lo = Duration::from_millis(window_start * 500);
        let hi = lo + Duration::from_secs(1);
        let in_window = grants.iter().filter(|g| **g >= lo && **g < hi).count();
        assert!(in_window <= 4 + 2, "window {lo:?}: {in_window} grants");
    }
    // 12 tokens with 4 up front need at least 4s of refill.
    assert!(grants[11] >= Duration::from_millis(3_900), "{:?}", grants[11]);
}

#[tokio::test(start_paused = true)]
async fn full_bucket_requests_are_spaced_by_refill_time() {
    // Each grant drains all 4 tokens; refilling them at 2/s takes 2s.
    let limiter = RateLimiter::new(4.0, 2.0);
    let start = tokio::time::Instant::now();
    for k in 0..6u64 {
        limiter.acquire(4.0).await;
        let at = start.elapsed();
        let due = Duration::from_secs(2 * k);
        assert!(at >= due && at < due + Duration::from_millis(10), "grant {k} at {at:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn try_acquire_does_not_wait() {
    let limiter = RateLimiter::new(2.0, 0.5);
    assert!(limiter.try_acquire(1.0).await);
    assert!(limiter.try_acquire(1.0).await);
    assert!(!limiter.try_acquire(1.0).await);
    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(limiter.try_acquire(1.0).await);
}
