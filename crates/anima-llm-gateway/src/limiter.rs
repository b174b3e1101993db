//! Token-bucket rate limiter pacing requests to the model backend.
//!
//! Tokens regenerate at a fixed rate up to a burst capacity; each request
//! consumes one. The non-blocking acquire reports rejection immediately,
//! the async variant sleeps for the computed refill delay and retries until
//! granted (unless the refill rate is zero, in which case waiting would
//! never succeed and the rejection is surfaced).

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Inner {
    tokens: f64,
    last_update: Instant,
    total_requests: u64,
    accepted: u64,
    rejected: u64,
}

/// Point-in-time limiter statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    /// Limiter name.
    pub name: String,
    /// Refill rate in tokens per second.
    pub rate: f64,
    /// Burst capacity.
    pub burst: u32,
    /// Currently available tokens.
    pub available_tokens: f64,
    /// Total acquire attempts.
    pub total_requests: u64,
    /// Accepted attempts.
    pub accepted: u64,
    /// Rejected attempts.
    pub rejected: u64,
    /// Acceptance percentage.
    pub acceptance_rate: f64,
}

/// Token bucket with a named identity for logs and stats.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    rate: f64,
    burst: u32,
    inner: Mutex<Inner>,
}

impl TokenBucket {
    /// Create a bucket starting full.
    pub fn new(name: impl Into<String>, rate: f64, burst: u32) -> Self {
        let name = name.into();
        info!(limiter = %name, rate, burst, "rate limiter initialised");
        Self {
            name,
            rate,
            burst,
            inner: Mutex::new(Inner {
                tokens: burst as f64,
                last_update: Instant::now(),
                total_requests: 0,
                accepted: 0,
                rejected: 0,
            }),
        }
    }

    fn refill(&self, inner: &mut Inner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_update).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.rate).min(self.burst as f64);
        inner.last_update = now;
    }

    /// Try to take `tokens` tokens without waiting.
    pub fn acquire(&self, tokens: f64) -> bool {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        self.refill(&mut inner);
        if inner.tokens >= tokens {
            inner.tokens -= tokens;
            inner.accepted += 1;
            true
        } else {
            inner.rejected += 1;
            warn!(
                limiter = %self.name,
                available = format!("{:.2}", inner.tokens),
                burst = self.burst,
                "rate limit exceeded"
            );
            false
        }
    }

    /// Take `tokens` tokens, sleeping for the computed refill delay between
    /// attempts. Returns `false` only when the refill rate is zero and the
    /// bucket is exhausted, since no amount of waiting would help.
    pub async fn acquire_async(&self, tokens: f64) -> bool {
        loop {
            if self.acquire(tokens) {
                return true;
            }
            if self.rate <= 0.0 {
                return false;
            }
            let wait = self.time_until_available(tokens);
            debug!(limiter = %self.name, wait_secs = wait.as_secs_f64(), "waiting for tokens");
            tokio::time::sleep(wait).await;
        }
    }

    /// How long until `tokens` tokens will be available; zero if they
    /// already are.
    pub fn time_until_available(&self, tokens: f64) -> Duration {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        if inner.tokens >= tokens {
            return Duration::ZERO;
        }
        if self.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((tokens - inner.tokens) / self.rate)
    }

    /// Refill the bucket to capacity.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.tokens = self.burst as f64;
        inner.last_update = Instant::now();
        info!(limiter = %self.name, "rate limiter reset");
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> LimiterStats {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        let acceptance = if inner.total_requests > 0 {
            inner.accepted as f64 / inner.total_requests as f64 * 100.0
        } else {
            100.0
        };
        LimiterStats {
            name: self.name.clone(),
            rate: self.rate,
            burst: self.burst,
            available_tokens: (inner.tokens * 100.0).round() / 100.0,
            total_requests: inner.total_requests,
            accepted: inner.accepted,
            rejected: inner.rejected,
            acceptance_rate: (acceptance * 100.0).round() / 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_reject() {
        let bucket = TokenBucket::new("chat", 10.0, 5);
        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..15 {
            if bucket.acquire(1.0) {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }
        assert_eq!(accepted, 5);
        assert_eq!(rejected, 10);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let bucket = TokenBucket::new("chat", 10.0, 5);
        for _ in 0..5 {
            assert!(bucket.acquire(1.0));
        }
        assert!(!bucket.acquire(1.0));

        // 0.5s at 10 tokens/s refills ~5 tokens.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(bucket.acquire(1.0));
    }

    #[test]
    fn zero_rate_allows_exactly_burst() {
        let bucket = TokenBucket::new("frozen", 0.0, 3);
        assert!(bucket.acquire(1.0));
        assert!(bucket.acquire(1.0));
        assert!(bucket.acquire(1.0));
        assert!(!bucket.acquire(1.0));
        // No refill ever happens.
        assert!(!bucket.acquire(1.0));

        bucket.reset();
        assert!(bucket.acquire(1.0));
    }

    #[tokio::test]
    async fn acquire_async_waits_for_refill() {
        let bucket = TokenBucket::new("chat", 20.0, 1);
        assert!(bucket.acquire(1.0));
        let start = Instant::now();
        assert!(bucket.acquire_async(1.0).await);
        // One token at 20/s takes ~50ms to regenerate.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn acquire_async_rejects_at_zero_rate() {
        let bucket = TokenBucket::new("frozen", 0.0, 1);
        assert!(bucket.acquire_async(1.0).await);
        assert!(!bucket.acquire_async(1.0).await);
    }

    #[test]
    fn stats_track_accept_and_reject() {
        let bucket = TokenBucket::new("chat", 0.0, 2);
        bucket.acquire(1.0);
        bucket.acquire(1.0);
        bucket.acquire(1.0);
        let stats = bucket.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 1);
    }
}
