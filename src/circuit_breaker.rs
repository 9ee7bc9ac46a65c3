//! Per-provider failure isolation: closed/half-open/open, the textbook
//! three-state breaker.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_failures: u32,
    pub reset_timeout: Duration,
}

struct Breaker {
    limits: Limits,
    state: State,
    failure_count: u32,
    last_failure_at: Option<Instant>,
}

impl Breaker {
    fn new(limits: Limits) -> Self {
        Self {
            limits,
            state: State::Closed,
            failure_count: 0,
            last_failure_at: None,
        }
    }
}

/// Tracks breaker state per named provider. Unknown providers are always
/// permitted (no breaker configured for them).
pub struct CircuitBreaker {
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(limits: impl IntoIterator<Item = (String, Limits)>) -> Self {
        let breakers = limits
            .into_iter()
            .map(|(name, limits)| (name, Breaker::new(limits)))
            .collect();
        Self {
            breakers: Mutex::new(breakers),
        }
    }

    /// Returns whether a call to `provider` should be attempted right now.
    /// A `HalfOpen` admission consumes the single probe slot: the breaker
    /// immediately advances its internal bookkeeping so concurrent callers
    /// don't all probe at once. Once a probe is outstanding (state is
    /// `HalfOpen`), every other caller is denied until `on_success` or
    /// `on_failure` resolves it.
    pub async fn allow(&self, provider: &str) -> bool {
        let mut breakers = self.breakers.lock().await;
        let Some(breaker) = breakers.get_mut(provider) else {
            return true;
        };

        match breaker.state {
            State::Closed => true,
            State::HalfOpen => false,
            State::Open => {
                let elapsed = breaker
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);

                if elapsed >= breaker.limits.reset_timeout {
                    breaker.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn on_success(&self, provider: &str) {
        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(provider) {
            breaker.state = State::Closed;
            breaker.failure_count = 0;
        }
    }

    pub async fn on_failure(&self, provider: &str) {
        let mut breakers = self.breakers.lock().await;
        let Some(breaker) = breakers.get_mut(provider) else {
            return;
        };

        breaker.last_failure_at = Some(Instant::now());

        match breaker.state {
            State::HalfOpen => {
                breaker.state = State::Open;
            }
            State::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= breaker.limits.max_failures {
                    warn!(provider, "circuit breaker opened");
                    breaker.state = State::Open;
                }
            }
            State::Open => {}
        }
    }

    pub async fn state_is_open(&self, provider: &str) -> bool {
        let breakers = self.breakers.lock().await;
        breakers
            .get(provider)
            .is_some_and(|b| b.state == State::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_failures: u32, reset_timeout: Duration) -> Limits {
        Limits { max_failures, reset_timeout }
    }

    #[tokio::test]
    async fn opens_after_max_failures() {
        let breaker = CircuitBreaker::new([("p".to_string(), limits(3, Duration::from_secs(60)))]);
        for _ in 0..3 {
            assert!(breaker.allow("p").await);
            breaker.on_failure("p").await;
        }
        assert!(!breaker.allow("p").await);
        assert!(breaker.state_is_open("p").await);
    }

    #[tokio::test]
    async fn half_open_success_closes() {
        let breaker = CircuitBreaker::new([("p".to_string(), limits(1, Duration::from_millis(10)))]);
        breaker.allow("p").await;
        breaker.on_failure("p").await;
        assert!(!breaker.allow("p").await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow("p").await);
        breaker.on_success("p").await;
        assert!(!breaker.state_is_open("p").await);
        assert!(breaker.allow("p").await);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new([("p".to_string(), limits(1, Duration::from_millis(10)))]);
        breaker.allow("p").await;
        breaker.on_failure("p").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow("p").await);
        breaker.on_failure("p").await;
        assert!(breaker.state_is_open("p").await);
    }

    #[tokio::test]
    async fn unknown_provider_always_allowed() {
        let breaker = CircuitBreaker::new(std::iter::empty());
        assert!(breaker.allow("unknown").await);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_concurrent_probe() {
        let breaker = CircuitBreaker::new([("p".to_string(), limits(1, Duration::from_millis(10)))]);
        breaker.allow("p").await;
        breaker.on_failure("p").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(breaker.allow("p").await, "first caller wins the probe slot");
        assert!(!breaker.allow("p").await, "a second concurrent caller must not also probe");
        assert!(!breaker.allow("p").await, "still denied while the probe is outstanding");

        breaker.on_success("p").await;
        assert!(breaker.allow("p").await, "closed again after the probe succeeds");
    }
}
