// src/platform/ratelimit.rs
// Token bucket wrapped around each adapter's underlying client so one noisy
// deployment cannot trip a platform's API limits.

use std::time::Instant;
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_s: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity.max(1));
        TokenBucket {
            capacity,
            refill_per_s: f64::from(config.refill_per_s.max(1)),
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_s).min(self.capacity);
                state.last_refill = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some((1.0 - state.tokens) / self.refill_per_s)
                }
            };
            match wait {
                None => return,
                Some(seconds) => tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_is_free() {
        let bucket = TokenBucket::new(RateLimitConfig { capacity: 4, refill_per_s: 1 });
        let start = Instant::now();
        for _ in 0..4 {
            bucket.acquire().await;
        }
        assert!(start.elapsed().as_millis() < 100);
    }

    #[tokio::test]
    async fn exhausted_bucket_forces_a_wait() {
        let bucket = TokenBucket::new(RateLimitConfig { capacity: 1, refill_per_s: 10 });
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        // One token at 10/s refill needs roughly 100ms.
        assert!(start.elapsed().as_millis() >= 50);
    }
}
