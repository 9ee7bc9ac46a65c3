//! Multi-provider balance reader: ordered fallback across providers, with
//! per-provider rate limiting (`crate::rate_limiter`), per-provider circuit
//! breaking (`crate::circuit_breaker`), and a short-lived balance cache
//! (`crate::balance_cache`) in front of all of it.

pub mod providers;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{instrument, warn};

use crate::balance_cache::BalanceCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::rate_limiter::RateLimiter;

pub use providers::{BalanceProvider, ProviderError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("provider {provider} failed: {source}")]
    Provider {
        provider: &'static str,
        #[source]
        source: ProviderError,
    },
    #[error("all balance providers failed, last error from {last_provider}: {last_error}")]
    AllProvidersFailed {
        last_provider: &'static str,
        last_error: ProviderError,
    },
}

const BACKOFF_SCHEDULE: [Duration; 3] = [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)];

/// The ordered set of balance providers, plus the shared rate limiter,
/// breaker, and cache that gate every call to them.
pub struct ChainReader {
    providers: Vec<Arc<dyn BalanceProvider>>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    cache: BalanceCache,
    static_fallback_address: Option<String>,
    per_call_deadline: Duration,
}

impl ChainReader {
    #[must_use]
    pub fn new(
        providers: Vec<Arc<dyn BalanceProvider>>,
        limiter: RateLimiter,
        breaker: CircuitBreaker,
        cache: BalanceCache,
        static_fallback_address: Option<String>,
        per_call_deadline: Duration,
    ) -> Self {
        Self {
            providers,
            limiter,
            breaker,
            cache,
            static_fallback_address,
            per_call_deadline,
        }
    }

    /// Returns the confirmed + mempool balance for `address`, in satoshis,
    /// consulting the cache first.
    #[instrument(level = "debug", skip(self))]
    pub async fn balance(&self, address: &str) -> Result<u64, Error> {
        if let Some(cached) = self.cache.get(address).await {
            return Ok(cached);
        }

        let sats = self.balance_uncached(address).await?;
        self.cache.set(address, sats).await;
        Ok(sats)
    }

    /// Bypasses the cache entirely. Used by recycle/refill/audit paths that
    /// must not act on a stale zero balance.
    #[instrument(level = "debug", skip(self))]
    pub async fn balance_fresh(&self, address: &str) -> Result<u64, Error> {
        let sats = self.balance_uncached(address).await?;
        self.cache.set(address, sats).await;
        Ok(sats)
    }

    async fn balance_uncached(&self, address: &str) -> Result<u64, Error> {
        let mut last_error: Option<(&'static str, ProviderError)> = None;

        for provider in &self.providers {
            let name = provider.name();

            if !self.breaker.allow(name).await {
                continue;
            }

            match self.call_with_retry(provider.as_ref(), address).await {
                Ok(sats) => {
                    self.breaker.on_success(name).await;
                    return Ok(sats);
                }
                Err(err) => {
                    self.breaker.on_failure(name).await;
                    warn!(provider = name, error = %err, "balance provider failed");
                    last_error = Some((name, err));
                }
            }
        }

        if let Some(address) = &self.static_fallback_address {
            if let Some(provider) = self.providers.first() {
                if let Ok(sats) = self.call_with_retry(provider.as_ref(), address).await {
                    return Ok(sats);
                }
            }
        }

        let (last_provider, last_error) = last_error.unwrap_or((
            "none",
            ProviderError::Network("no providers configured".to_owned()),
        ));
        Err(Error::AllProvidersFailed { last_provider, last_error })
    }

    async fn call_with_retry(&self, provider: &dyn BalanceProvider, address: &str) -> Result<u64, ProviderError> {
        let mut attempt = 0usize;
        loop {
            self.limiter
                .acquire(provider.name(), self.per_call_deadline)
                .await
                .map_err(|_| ProviderError::Network("rate limiter deadline exceeded".to_owned()))?;

            match provider.balance(address).await {
                Ok(sats) => return Ok(sats),
                Err(ProviderError::RateLimited) if attempt < BACKOFF_SCHEDULE.len() => {
                    tokio::time::sleep(BACKOFF_SCHEDULE[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Additional read used by the supervisor's audit pass: balance plus
    /// transaction count, so a discrepancy can be attributed to a missed
    /// payment rather than a provider bug.
    pub async fn check_history(&self, address: &str) -> Result<(u64, u64), Error> {
        for provider in &self.providers {
            let name = provider.name();
            if !self.breaker.allow(name).await {
                continue;
            }
            if let Ok(result) = provider.history(address).await {
                self.breaker.on_success(name).await;
                return Ok(result);
            }
            self.breaker.on_failure(name).await;
        }
        Err(Error::AllProvidersFailed {
            last_provider: "none",
            last_error: ProviderError::Network("no provider could serve history".to_owned()),
        })
    }
}
