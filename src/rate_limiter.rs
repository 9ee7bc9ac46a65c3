//! Per-provider request pacing: a token bucket with a minimum inter-request
//! interval floor on top, so a provider with a generous bucket but a strict
//! "one request per second" policy is still respected.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub capacity: u32,
    pub window: Duration,
    pub min_interval: Duration,
}

struct Bucket {
    limits: Limits,
    tokens: f64,
    last_refill: Instant,
    last_request: Option<Instant>,
}

impl Bucket {
    fn new(limits: Limits) -> Self {
        Self {
            limits,
            tokens: f64::from(limits.capacity),
            last_refill: Instant::now(),
            last_request: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let rate = f64::from(self.limits.capacity) / self.limits.window.as_secs_f64();
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(f64::from(self.limits.capacity));
        self.last_refill = now;
    }

    fn time_until_ready(&self, now: Instant) -> Duration {
        let interval_wait = self
            .last_request
            .map(|t| self.limits.min_interval.saturating_sub(now.saturating_duration_since(t)))
            .unwrap_or_default();

        let token_wait = if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let rate = f64::from(self.limits.capacity) / self.limits.window.as_secs_f64();
            Duration::from_secs_f64((1.0 - self.tokens) / rate)
        };

        interval_wait.max(token_wait)
    }
}

/// Per-provider rate limiter. Unknown provider names are unmetered, since the
/// blockchain query layer only registers limits for the providers it knows about.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limits: impl IntoIterator<Item = (String, Limits)>) -> Self {
        let buckets = limits
            .into_iter()
            .map(|(name, limits)| (name, Bucket::new(limits)))
            .collect();
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// Blocks until a slot for `provider` is available, or returns an error
    /// if `deadline` elapses first. Providers with no registered limits
    /// acquire immediately.
    pub async fn acquire(&self, provider: &str, deadline: Duration) -> Result<(), Cancelled> {
        let start = Instant::now();
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let Some(bucket) = buckets.get_mut(provider) else {
                    return Ok(());
                };

                let now = Instant::now();
                bucket.refill(now);
                let wait = bucket.time_until_ready(now);

                if wait.is_zero() {
                    bucket.tokens -= 1.0;
                    bucket.last_request = Some(now);
                    return Ok(());
                }
                wait
            };

            if start.elapsed() + wait > deadline {
                return Err(Cancelled);
            }
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("rate limiter acquire cancelled: deadline exceeded")]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_provider_is_unmetered() {
        let limiter = RateLimiter::new(std::iter::empty());
        limiter.acquire("whatever", Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn min_interval_is_enforced() {
        let limiter = RateLimiter::new([(
            "p".to_string(),
            Limits {
                capacity: 100,
                window: Duration::from_secs(60),
                min_interval: Duration::from_millis(50),
            },
        )]);

        let start = Instant::now();
        limiter.acquire("p", Duration::from_secs(1)).await.unwrap();
        limiter.acquire("p", Duration::from_secs(1)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn deadline_exceeded_is_cancelled() {
        let limiter = RateLimiter::new([(
            "p".to_string(),
            Limits {
                capacity: 1,
                window: Duration::from_secs(60),
                min_interval: Duration::from_secs(60),
            },
        )]);

        limiter.acquire("p", Duration::from_secs(1)).await.unwrap();
        let result = limiter.acquire("p", Duration::from_millis(10)).await;
        assert!(result.is_err());
    }
}
