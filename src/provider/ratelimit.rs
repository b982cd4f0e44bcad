use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket shared by every outbound provider request. Callers take one
/// token per HTTP request, so paged listings pay for each page.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    interval: Duration,
    burst: f64,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// One token every `interval`, holding at most `burst` tokens.
    pub fn new(interval: Duration, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
            interval,
            burst,
        }
    }

    /// Waits until a token is available and takes it. Waiters are served in
    /// arrival order.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens < 1.0 && !self.interval.is_zero() {
            let missing = 1.0 - bucket.tokens;
            tokio::time::sleep(self.interval.mul_f64(missing)).await;
            self.refill(&mut bucket);
        }
        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        if self.interval.is_zero() {
            bucket.tokens = self.burst;
        } else {
            let earned = now.duration_since(bucket.last).as_secs_f64() / self.interval.as_secs_f64();
            bucket.tokens = (bucket.tokens + earned).min(self.burst);
        }
        bucket.last = now;
    }
}
