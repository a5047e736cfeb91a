//! Token bucket admission control for outbound volume.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Poll interval used by [`RateLimiter::wait`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter. Starts full.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `rate` tokens are added per second, up to `capacity`.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            capacity,
            rate,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens if available. Leaves the bucket untouched otherwise.
    pub fn allow(&self, n: f64) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Wait until `n` tokens can be taken.
    ///
    /// `n` must not exceed the capacity or this never returns.
    pub async fn wait(&self, n: f64) {
        while !self.allow(n) {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_allow_consumes_tokens() {
        let limiter = RateLimiter::new(10.0, 100.0);
        assert!(limiter.allow(60.0));
        assert!(limiter.allow(40.0));
        assert!(!limiter.allow(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_request_has_no_side_effects() {
        let limiter = RateLimiter::new(10.0, 100.0);
        assert!(limiter.allow(90.0));
        assert!(!limiter.allow(50.0));
        // The failed request did not drain the remaining 10 tokens
        assert!(limiter.allow(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_proportional_and_capped() {
        let limiter = RateLimiter::new(10.0, 100.0);
        assert!(limiter.allow(100.0));

        tokio::time::advance(Duration::from_secs(3)).await;
        let available = limiter.available();
        assert!((available - 30.0).abs() < 1e-6, "available = {available}");

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_refilled() {
        let limiter = RateLimiter::new(10.0, 50.0);
        assert!(limiter.allow(50.0));

        let start = Instant::now();
        limiter.wait(20.0).await;
        let waited = start.elapsed();

        assert!(waited >= Duration::from_secs(2));
        assert!(waited <= Duration::from_millis(2200));
    }
}
