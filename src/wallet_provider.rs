//! Adapter to the upstream HD-wallet address generator: a single HTTP call
//! per new address, with the upstream's gap-limit refusal distinguished from
//! any other failure.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;
use url::Url;

use crate::secret::Secret;

#[derive(Debug, Error)]
pub enum Error {
    #[error("upstream wallet provider refused to generate an address (gap limit)")]
    GapLimit,
    #[error("wallet provider request failed: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest<'a> {
    label: &'a str,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

/// One call to the wallet provider: generate a fresh address labelled for
/// a given customer/site. Errors carrying a gap-limit indication in the
/// response body are classified as `Error::GapLimit`.
pub struct WalletProvider {
    target_url: Url,
    client: reqwest::Client,
}

impl WalletProvider {
    /// # Errors
    ///
    /// Returns `Err` if `base_url` does not parse or the HTTP client cannot
    /// be constructed.
    pub fn new(base_url: &str, api_key: &Secret<String>, timeout: Duration) -> anyhow::Result<Self> {
        let target_url = Url::parse(base_url)?;
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", api_key.expose()).parse()?,
                );
                headers
            })
            .build()?;

        Ok(Self { target_url, client })
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn generate_address(&self, label: &str, amount: f64) -> Result<String, Error> {
        let url = self
            .target_url
            .join("new_address")
            .map_err(|e| Error::Provider(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(&GenerateRequest { label, amount })
            .send()
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body: ErrorBody = response.json().await.unwrap_or(ErrorBody { error: String::new() });

            if status == StatusCode::CONFLICT || body.error.to_lowercase().contains("gap limit") {
                return Err(Error::GapLimit);
            }

            return Err(Error::Provider(format!("http {status}: {}", body.error)));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| Error::Provider(e.to_string()))?;
        Ok(body.address)
    }
}
