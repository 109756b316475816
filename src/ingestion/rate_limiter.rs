//! Token bucket rate limiting for the spreadsheet provider
//!
//! Google Sheets enforces two overlapping read quotas:
//! - 300 requests per minute (refills at 5/s)
//! - 100 requests per 100 seconds (refills at 1/s)
//!
//! Both are modelled as continuously refilling buckets scaled by a safety
//! factor. One mutex guards every bucket, so refill, check and decrement happen
//! as a single step across both windows. Waiting happens outside the lock.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Cannot acquire {requested} tokens, bucket capacity is {capacity}")]
    ExceedsCapacity { requested: u32, capacity: u32 },
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Full bucket holding `capacity` tokens, refilling at `refill_rate` tokens/second
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(f64::from(self.capacity));
        self.last_refill = now;
    }

    /// Time until `n` tokens are available at the current refill rate
    fn wait_for(&self, n: u32) -> Duration {
        let needed = f64::from(n) - self.tokens;
        if needed <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(needed / self.refill_rate).unwrap_or(Duration::from_secs(1))
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<Vec<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(buckets: Vec<TokenBucket>) -> Self {
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// The two Google Sheets read quotas scaled by `safety_factor`
    pub fn google_sheets(safety_factor: f64) -> Self {
        let per_minute = TokenBucket::new((300.0 * safety_factor).floor() as u32, 5.0 * safety_factor);
        let per_100s = TokenBucket::new((100.0 * safety_factor).floor() as u32, 1.0 * safety_factor);

        log::info!(
            "🚦 Rate limiter: {}/min (refill {:.2}/s), {}/100s (refill {:.2}/s)",
            per_minute.capacity(),
            per_minute.refill_rate(),
            per_100s.capacity(),
            per_100s.refill_rate()
        );

        Self::new(vec![per_minute, per_100s])
    }

    // Bucket state stays numerically valid even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, Vec<TokenBucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_capacity(&self, buckets: &[TokenBucket], n: u32) -> Result<(), RateLimitError> {
        match buckets.iter().map(TokenBucket::capacity).min() {
            Some(capacity) if n > capacity => Err(RateLimitError::ExceedsCapacity {
                requested: n,
                capacity,
            }),
            _ => Ok(()),
        }
    }

    /// Take `n` tokens from every bucket, or report how long to wait
    fn take_or_wait(&self, n: u32) -> Result<Option<Duration>, RateLimitError> {
        let mut buckets = self.lock();
        self.check_capacity(&buckets, n)?;

        let now = Instant::now();
        for bucket in buckets.iter_mut() {
            bucket.refill(now);
        }

        let wait = buckets
            .iter()
            .map(|bucket| bucket.wait_for(n))
            .max()
            .unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            return Ok(Some(wait));
        }

        for bucket in buckets.iter_mut() {
            bucket.tokens -= f64::from(n);
        }
        Ok(None)
    }

    /// Wait until `n` tokens are available in every bucket, then take them
    pub async fn acquire(&self, n: u32) -> Result<(), RateLimitError> {
        loop {
            match self.take_or_wait(n)? {
                None => return Ok(()),
                Some(wait) => {
                    log::debug!("⏳ Rate limited, waiting {:.2}s for {} tokens", wait.as_secs_f64(), n);
                    sleep(wait).await;
                }
            }
        }
    }

    /// Take `n` tokens from every bucket only if all of them have enough
    pub fn try_acquire(&self, n: u32) -> Result<bool, RateLimitError> {
        Ok(self.take_or_wait(n)?.is_none())
    }

    /// Refill-projected tokens per bucket
    pub fn available_tokens(&self) -> Vec<f64> {
        let mut buckets = self.lock();
        let now = Instant::now();
        buckets
            .iter_mut()
            .map(|bucket| {
                bucket.refill(now);
                bucket.tokens
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_google_sheets_buckets() {
        let limiter = RateLimiter::google_sheets(0.8);
        assert_eq!(limiter.available_tokens(), vec![240.0, 80.0]);

        assert!(limiter.try_acquire(80).unwrap());
        assert!(!limiter.try_acquire(1).unwrap());

        // A failed try_acquire takes nothing from the per-minute bucket either
        let tokens = limiter.available_tokens();
        assert_eq!(tokens[0], 160.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_slowest_bucket() {
        let limiter = RateLimiter::google_sheets(0.8);
        assert!(limiter.try_acquire(80).unwrap());

        let start = Instant::now();
        limiter.acquire(2).await.unwrap();
        let waited = start.elapsed();

        // 2 tokens at 0.8/s
        assert!(waited >= Duration::from_millis(2_500), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(2_600), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exceeding_capacity_fails_immediately() {
        let limiter = RateLimiter::google_sheets(0.8);
        let err = limiter.acquire(81).await.unwrap_err();
        assert_eq!(
            err,
            RateLimitError::ExceedsCapacity {
                requested: 81,
                capacity: 80
            }
        );
        assert_eq!(limiter.available_tokens(), vec![240.0, 80.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let limiter = RateLimiter::new(vec![TokenBucket::new(5, 10.0)]);
        assert!(limiter.try_acquire(3).unwrap());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available_tokens(), vec![5.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_never_overdraw() {
        let limiter = Arc::new(RateLimiter::new(vec![TokenBucket::new(4, 2.0)]));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(2).await.unwrap();
                limiter.available_tokens()[0]
            }));
        }

        for handle in handles {
            let remaining = handle.await.unwrap();
            assert!(remaining >= 0.0 && remaining <= 4.0, "remaining {}", remaining);
        }
    }
}
