//! Per-service token-bucket admission control

use parking_lot::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// A token bucket with capacity and refill rate both equal to the
/// configured requests-per-second value.
///
/// Shared by every concurrent request to one service; the internal mutex
/// makes admission decisions linearizable. Denied callers are rejected
/// immediately, there is no queuing.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter admitting `rate` requests per second
    pub fn new(rate: u32) -> Self {
        let rate = f64::from(rate);
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last_update: Instant::now(),
            }),
        }
    }

    /// Consume one token if available
    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();

        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
