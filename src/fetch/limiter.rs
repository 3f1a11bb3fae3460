use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use tokio::time::{sleep, Instant};

use crate::error::{AppError, Result};

/// Token bucket sized to the quote API's published per-minute quota.
/// Tokens refill continuously; a full bucket holds one minute's quota.
#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute.max(1);
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate: capacity as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill);
        let refill = elapsed.as_secs_f64() * self.refill_rate;
        self.tokens = (self.tokens + refill).min(self.capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

/// Awaitable wrapper around the bucket. `acquire` blocks until a token is
/// available, up to `max_wait`; past that it fails fast with `RateLimited`
/// so a saturated queue surfaces as a symbol failure instead of stalling the
/// whole cycle. The mutex is held only for bucket arithmetic, never across
/// an await.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(per_minute: u32, max_wait: Duration) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(per_minute)),
            max_wait,
        }
    }

    pub async fn acquire(&self) -> Result<()> {
        let mut waited = Duration::ZERO;
        loop {
            let pending = {
                let mut bucket = self.bucket.lock().unwrap();
                if bucket.try_acquire(Instant::now()) {
                    return Ok(());
                }
                bucket.time_until_available()
            };

            let pending = pending.max(Duration::from_millis(10));
            if waited + pending > self.max_wait {
                return Err(AppError::RateLimited(pending));
            }

            debug!("Rate limiter saturated, waiting {:?} for a token", pending);
            sleep(pending).await;
            waited += pending;
        }
    }
}
