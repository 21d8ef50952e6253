//! Request pacing for the lookup API
//!
//! Two pieces:
//! - a token bucket shared by every dispatch worker, capping lookup requests per second
//! - a randomized inter-attempt delay so retries from many workers do not line up

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// A token bucket rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_update: Instant,
    /// false when the configured rate is 0 (unlimited)
    enabled: bool,
}

impl RateLimiter {
    /// If `requests_per_second` is 0, rate limiting is disabled
    pub fn new(requests_per_second: u32) -> Self {
        let enabled = requests_per_second > 0;
        let max_tokens = if enabled {
            // burst of up to one second worth of requests
            requests_per_second as f64
        } else {
            f64::INFINITY
        };

        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate: requests_per_second as f64,
            last_update: Instant::now(),
            enabled,
        }
    }

    fn refill(&mut self) {
        if !self.enabled {
            return;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_update = now;
    }

    /// Try to take a token, returning how long to wait if none is available
    pub fn try_acquire(&mut self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }

        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let wait_secs = (1.0 - self.tokens) / self.refill_rate;
            Some(Duration::from_secs_f64(wait_secs))
        }
    }

    pub async fn acquire(&mut self) {
        // Re-check after every sleep; other callers may have drained the bucket meanwhile
        while let Some(wait_duration) = self.try_acquire() {
            debug!("Rate limiter waiting {:?} for token", wait_duration);
            sleep(wait_duration).await;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Thread-safe rate limiter handle shared by all workers of a run
#[derive(Debug, Clone)]
pub struct SharedRateLimiter {
    inner: Arc<Mutex<RateLimiter>>,
}

impl SharedRateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateLimiter::new(requests_per_second))),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub async fn acquire(&self) {
        let mut limiter = self.inner.lock().await;
        limiter.acquire().await;
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.is_enabled()
    }
}

/// Randomized delay between attempts for the same identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptDelay {
    min: Duration,
    max: Duration,
}

impl AttemptDelay {
    /// `min` and `max` are swapped if given in the wrong order
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Pick a delay uniformly in `[min, max]`
    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}
