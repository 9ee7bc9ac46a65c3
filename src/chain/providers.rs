//! Concrete balance providers. Each wraps a `reqwest::Client` and knows only
//! its own endpoint shape and JSON schema; fallback ordering, rate limiting,
//! and breaking all live in `super::ChainReader`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

const USER_AGENT: &str = "btc-payment-monitor/0.1";

#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited")]
    RateLimited,
    #[error("unexpected response shape: {0}")]
    Schema(String),
}

/// A single balance-reading backend. Implementations must be `Send + Sync`
/// since providers are shared across the observer tasks that poll them.
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    /// Stable identifier used for rate-limiter/breaker bucketing and metrics.
    fn name(&self) -> &'static str;

    /// Confirmed + unconfirmed (mempool) balance, in satoshis.
    async fn balance(&self, address: &str) -> Result<u64, ProviderError>;

    /// Balance plus a transaction count, used by the audit pass.
    async fn history(&self, address: &str) -> Result<(u64, u64), ProviderError>;
}

fn client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .expect("reqwest client configuration is static and always valid")
}

fn map_status(status: reqwest::StatusCode) -> Option<ProviderError> {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
        Some(ProviderError::RateLimited)
    } else if !status.is_success() {
        Some(ProviderError::Network(format!("http status {status}")))
    } else {
        None
    }
}

/// `mempool.space`-shaped API, also used by several mempool.space-compatible
/// mirrors (`blockstream.info` uses the identical schema).
pub struct EsploraProvider {
    name: &'static str,
    base_url: String,
    http: reqwest::Client,
}

impl EsploraProvider {
    #[must_use]
    pub fn new(name: &'static str, base_url: String, timeout: Duration) -> Self {
        Self { name, base_url, http: client(timeout) }
    }
}

#[derive(Deserialize)]
struct EsploraChainStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
    tx_count: u64,
}

#[derive(Deserialize)]
struct EsploraMempoolStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Deserialize)]
struct EsploraAddressInfo {
    chain_stats: EsploraChainStats,
    mempool_stats: EsploraMempoolStats,
}

#[async_trait]
impl BalanceProvider for EsploraProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn balance(&self, address: &str) -> Result<u64, ProviderError> {
        let info = self.fetch(address).await?;
        let chain = info.chain_stats.funded_txo_sum.saturating_sub(info.chain_stats.spent_txo_sum);
        let mempool = info
            .mempool_stats
            .funded_txo_sum
            .saturating_sub(info.mempool_stats.spent_txo_sum);
        Ok(chain + mempool)
    }

    async fn history(&self, address: &str) -> Result<(u64, u64), ProviderError> {
        let info = self.fetch(address).await?;
        let balance = info.chain_stats.funded_txo_sum.saturating_sub(info.chain_stats.spent_txo_sum);
        Ok((balance, info.chain_stats.tx_count))
    }
}

impl EsploraProvider {
    async fn fetch(&self, address: &str) -> Result<EsploraAddressInfo, ProviderError> {
        let url = format!("{}/address/{address}", self.base_url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if let Some(err) = map_status(response.status()) {
            return Err(err);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Schema(e.to_string()))
    }
}

/// Trezor blockbook-shaped API (`/api/v2/address/{addr}`).
pub struct BlockbookProvider {
    name: &'static str,
    base_url: String,
    http: reqwest::Client,
}

impl BlockbookProvider {
    #[must_use]
    pub fn new(name: &'static str, base_url: String, timeout: Duration) -> Self {
        Self { name, base_url, http: client(timeout) }
    }
}

#[derive(Deserialize)]
struct BlockbookAddress {
    balance: String,
    #[serde(rename = "unconfirmedBalance")]
    unconfirmed_balance: String,
    #[serde(rename = "txs")]
    tx_count: u64,
}

#[async_trait]
impl BalanceProvider for BlockbookProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn balance(&self, address: &str) -> Result<u64, ProviderError> {
        let info = self.fetch(address).await?;
        Ok(parse_sats(&info.balance)? + parse_sats(&info.unconfirmed_balance)?)
    }

    async fn history(&self, address: &str) -> Result<(u64, u64), ProviderError> {
        let info = self.fetch(address).await?;
        Ok((parse_sats(&info.balance)?, info.tx_count))
    }
}

impl BlockbookProvider {
    async fn fetch(&self, address: &str) -> Result<BlockbookAddress, ProviderError> {
        let url = format!("{}/api/v2/address/{address}", self.base_url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if let Some(err) = map_status(response.status()) {
            return Err(err);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Schema(e.to_string()))
    }
}

fn parse_sats(s: &str) -> Result<u64, ProviderError> {
    s.parse().map_err(|_| ProviderError::Schema(format!("not an integer: {s}")))
}

/// blockchain.com `/rawaddr/{addr}` shaped API.
pub struct BlockchainComProvider {
    base_url: String,
    http: reqwest::Client,
}

impl BlockchainComProvider {
    #[must_use]
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self { base_url, http: client(timeout) }
    }
}

#[derive(Deserialize)]
struct RawAddr {
    final_balance: u64,
    n_tx: u64,
}

#[async_trait]
impl BalanceProvider for BlockchainComProvider {
    fn name(&self) -> &'static str {
        "blockchain"
    }

    async fn balance(&self, address: &str) -> Result<u64, ProviderError> {
        Ok(self.fetch(address).await?.final_balance)
    }

    async fn history(&self, address: &str) -> Result<(u64, u64), ProviderError> {
        let info = self.fetch(address).await?;
        Ok((info.final_balance, info.n_tx))
    }
}

impl BlockchainComProvider {
    async fn fetch(&self, address: &str) -> Result<RawAddr, ProviderError> {
        let url = format!("{}/rawaddr/{address}", self.base_url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if let Some(err) = map_status(response.status()) {
            return Err(err);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Schema(e.to_string()))
    }
}

/// BlockCypher `/v1/btc/main/addrs/{addr}/balance` shaped API.
pub struct BlockCypherProvider {
    base_url: String,
    token: Option<crate::secret::Secret<String>>,
    http: reqwest::Client,
}

impl BlockCypherProvider {
    #[must_use]
    pub fn new(base_url: String, token: Option<crate::secret::Secret<String>>, timeout: Duration) -> Self {
        Self { base_url, token, http: client(timeout) }
    }
}

#[derive(Deserialize)]
struct BlockCypherBalance {
    balance: u64,
    unconfirmed_balance: u64,
    final_n_tx: u64,
}

#[async_trait]
impl BalanceProvider for BlockCypherProvider {
    fn name(&self) -> &'static str {
        "blockcypher"
    }

    async fn balance(&self, address: &str) -> Result<u64, ProviderError> {
        let info = self.fetch(address).await?;
        Ok(info.balance + info.unconfirmed_balance)
    }

    async fn history(&self, address: &str) -> Result<(u64, u64), ProviderError> {
        let info = self.fetch(address).await?;
        Ok((info.balance, info.final_n_tx))
    }
}

impl BlockCypherProvider {
    async fn fetch(&self, address: &str) -> Result<BlockCypherBalance, ProviderError> {
        let url = format!("{}/v1/btc/main/addrs/{address}/balance", self.base_url);
        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.query(&[("token", token.expose())]);
        }
        let response = request.send().await.map_err(|e| ProviderError::Network(e.to_string()))?;

        if let Some(err) = map_status(response.status()) {
            return Err(err);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Schema(e.to_string()))
    }
}

/// Blockonomics `/balance` shaped API; the only provider in the fallback
/// order that uses `POST` with a JSON body instead of a path parameter.
pub struct BlockonomicsProvider {
    base_url: String,
    http: reqwest::Client,
}

impl BlockonomicsProvider {
    #[must_use]
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self { base_url, http: client(timeout) }
    }
}

#[derive(Deserialize)]
struct BlockonomicsEntry {
    confirmed: i64,
    unconfirmed: i64,
}

#[derive(Deserialize)]
struct BlockonomicsResponse {
    response: Vec<BlockonomicsEntry>,
}

#[async_trait]
impl BalanceProvider for BlockonomicsProvider {
    fn name(&self) -> &'static str {
        "blockonomics"
    }

    async fn balance(&self, address: &str) -> Result<u64, ProviderError> {
        let entry = self.fetch(address).await?;
        Ok((entry.confirmed + entry.unconfirmed).max(0) as u64)
    }

    async fn history(&self, address: &str) -> Result<(u64, u64), ProviderError> {
        let entry = self.fetch(address).await?;
        Ok(((entry.confirmed + entry.unconfirmed).max(0) as u64, 0))
    }
}

impl BlockonomicsProvider {
    async fn fetch(&self, address: &str) -> Result<BlockonomicsEntry, ProviderError> {
        let url = format!("{}/balance", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "addr": [address] }))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if let Some(err) = map_status(response.status()) {
            return Err(err);
        }

        let mut parsed: BlockonomicsResponse =
            response.json().await.map_err(|e| ProviderError::Schema(e.to_string()))?;

        parsed
            .response
            .pop()
            .ok_or_else(|| ProviderError::Schema("empty response array".to_owned()))
    }
}
