use serde::{Deserialize, Serialize};

fn default_site() -> String {
    "default".to_owned()
}

/// Issues (or reuses) an address for `customer`. `site` selects which
/// `PoolRegistry` entry to use and defaults to `"default"` for deployments
/// that only ever run a single site.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    #[serde(default = "default_site")]
    pub site: String,
    pub customer: String,
    pub amount: f64,
    #[serde(default)]
    pub fast: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveResponse {
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub outcome: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    pub released: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatsResponse {
    pub site: String,
    pub available: usize,
    pub reserved: usize,
    pub used: usize,
    pub total_generated: u64,
    pub recycled: u64,
    pub gap_errors: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetUnpaidRequest {
    #[serde(default)]
    pub unpaid: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateThresholdsRequest {
    pub warn: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMaxGapRequest {
    pub max_gap: u64,
}
