// Token bucket limiting outbound language-model calls.
//
// Capacity equals requests-per-minute and tokens refill continuously.

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rpm: u32,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        Self {
            rpm,
            bucket: Mutex::new(Bucket {
                tokens: rpm as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.rpm
    }

    /// Waits until a token is available, then consumes it
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        let capacity = self.rpm as f64;
        let per_second = capacity / 60.0;

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * per_second).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            let wait = (1.0 - bucket.tokens) * 60.0 / capacity;
            tracing::debug!("Rate limit reached, waiting {:.3}s", wait);
            // Holding the lock keeps waiters in FIFO order
            sleep(Duration::from_secs_f64(wait)).await;
            bucket.tokens = 0.0;
            bucket.last_refill = Instant::now();
        } else {
            bucket.tokens -= 1.0;
        }
    }

    /// Tokens currently available, without refilling
    pub async fn available(&self) -> f64 {
        self.bucket.lock().await.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity_does_not_block() {
        let limiter = RateLimiter::new(60);
        let start = Instant::now();
        for _ in 0..60 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_over_capacity_waits_one_interval() {
        let limiter = RateLimiter::new(60);
        for _ in 0..60 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(990), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(1010), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_over_time() {
        let limiter = RateLimiter::new(120);
        for _ in 0..120 {
            limiter.acquire().await;
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
