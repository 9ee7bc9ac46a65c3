//! The sats-to-USD conversion seam described in `SPEC_FULL.md` §4.13. The
//! core never talks to a real exchange directly from its domain logic; it
//! only depends on this trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Error, Clone)]
pub enum RateOracleError {
    #[error("rate oracle request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait RateOracle: Send + Sync {
    async fn btc_usd(&self) -> Result<f64, RateOracleError>;
}

/// Thin reqwest client over a configurable URL. The fetched rate is cached
/// for a few seconds; a stale cached value is returned (rather than an
/// error) if a refresh fails, since the core tolerates staleness by design.
pub struct HttpRateOracle {
    url: String,
    http: reqwest::Client,
    cache: Mutex<Option<(f64, Instant)>>,
    cache_ttl: Duration,
}

impl HttpRateOracle {
    #[must_use]
    pub fn new(url: String, timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            url,
            http: reqwest::Client::builder().timeout(timeout).build().expect("static client config"),
            cache: Mutex::new(None),
            cache_ttl,
        }
    }
}

#[derive(serde::Deserialize)]
struct RateResponse {
    #[serde(rename = "USD")]
    usd: f64,
}

#[async_trait]
impl RateOracle for HttpRateOracle {
    async fn btc_usd(&self) -> Result<f64, RateOracleError> {
        {
            let cache = self.cache.lock().await;
            if let Some((rate, fetched_at)) = *cache {
                if fetched_at.elapsed() < self.cache_ttl {
                    return Ok(rate);
                }
            }
        }

        let fetch = async {
            let response: RateResponse = self
                .http
                .get(&self.url)
                .send()
                .await
                .map_err(|e| RateOracleError::Request(e.to_string()))?
                .json()
                .await
                .map_err(|e| RateOracleError::Request(e.to_string()))?;
            Ok::<_, RateOracleError>(response.usd)
        };

        match fetch.await {
            Ok(rate) => {
                let mut cache = self.cache.lock().await;
                *cache = Some((rate, Instant::now()));
                Ok(rate)
            }
            Err(e) => {
                let cache = self.cache.lock().await;
                if let Some((rate, _)) = *cache {
                    Ok(rate)
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Fixed-rate oracle used by tests and as a safe startup fallback when no
/// oracle URL is configured.
pub struct StaticRateOracle(pub f64);

#[async_trait]
impl RateOracle for StaticRateOracle {
    async fn btc_usd(&self) -> Result<f64, RateOracleError> {
        Ok(self.0)
    }
}

pub type SharedRateOracle = Arc<dyn RateOracle>;
