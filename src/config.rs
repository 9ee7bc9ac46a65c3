//! Typed configuration tree loaded from an optional TOML file plus
//! `MON__`-prefixed, double-underscore-separated environment variables, in
//! that order of precedence, with a handful of legacy single-name aliases
//! honored below both as a last-resort fallback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::secret::Secret;

/// Loads configuration from `config_file_path` (if given) and the
/// environment, in ascending order of precedence: legacy aliases, file,
/// `MON__`-prefixed environment variables.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or the merged settings do not
/// deserialize into `Config`.
pub fn load_config(config_file_path: Option<&Path>) -> anyhow::Result<Config> {
    let mut builder = config::Config::builder();

    for (path, value) in legacy_aliases() {
        builder = builder.set_default(path, value)?;
    }

    if let Some(path) = config_file_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let builder = builder.add_source(
        config::Environment::with_prefix("MON")
            .separator("__")
            .try_parsing(true),
    );

    Ok(builder.build()?.try_deserialize::<Config>()?)
}

/// Reads the handful of single-name environment variables the original
/// system read directly (see `SPEC_FULL.md` §6) and maps them onto their
/// `Config` path, so an operator migrating from the original deployment
/// doesn't have to rename every variable on day one.
fn legacy_aliases() -> Vec<(&'static str, String)> {
    let mappings: &[(&str, &str)] = &[
        ("MAX_GOROUTINES", "observer.max_concurrent"),
        ("MAX_MEMORY_MB", "max_memory_mb"),
        ("WALLET_PROVIDER_API_KEY", "wallet_provider.api_key"),
        ("WEBHOOK_SECRET", "webhook.secret"),
        ("STATIC_FALLBACK_ADDRESS", "static_fallback_address"),
        ("BLOCKCYPHER_TOKEN", "providers.blockcypher.token"),
        ("RATE_ORACLE_URL", "rate_oracle.url"),
    ];

    mappings
        .iter()
        .filter_map(|(env_name, config_path)| std::env::var(env_name).ok().map(|v| (*config_path, v)))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub wallet_provider: WalletProviderConfig,
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub rate_oracle: RateOracleConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub gap_limit: GapLimitSettings,
    #[serde(default)]
    pub observer: ObserverSettings,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default = "default::data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub static_fallback_address: Option<String>,

    /// Informational only; the original deployment used this to bound
    /// resident memory outside the process itself. Logged at startup, not
    /// otherwise enforced.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::balance_cache_ttl")]
    pub balance_cache_ttl: Duration,

    /// Deadline applied to every outbound balance-provider call and to the
    /// rate-limiter acquire that guards it.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::network_call_deadline")]
    pub network_call_deadline: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: SocketAddr,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::shutdown_timeout")]
    pub shutdown_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::shutdown_delay")]
    pub shutdown_delay: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::request_timeout")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletProviderConfig {
    pub base_url: String,
    pub api_key: Secret<String>,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::wallet_provider_timeout")]
    pub timeout: Duration,
}

/// Shape shared by every balance provider except Blockcypher (which carries
/// an optional token) and Blockonomics (which posts a body rather than
/// templating the address into the path, but otherwise needs nothing more).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    pub base_url: String,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::provider_timeout")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCypherConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<Secret<String>>,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::provider_timeout")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default::mempoolspace")]
    pub mempoolspace: ProviderEndpointConfig,
    #[serde(default = "default::blockstream")]
    pub blockstream: ProviderEndpointConfig,
    #[serde(default = "default::trezor")]
    pub trezor: ProviderEndpointConfig,
    #[serde(default = "default::blockchain")]
    pub blockchain: ProviderEndpointConfig,
    #[serde(default = "default::blockcypher")]
    pub blockcypher: BlockCypherConfig,
    #[serde(default = "default::blockonomics")]
    pub blockonomics: ProviderEndpointConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            mempoolspace: default::mempoolspace(),
            blockstream: default::blockstream(),
            trezor: default::trezor(),
            blockchain: default::blockchain(),
            blockcypher: default::blockcypher(),
            blockonomics: default::blockonomics(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateOracleConfig {
    /// When unset, the app falls back to a `StaticRateOracle` seeded with
    /// `static_rate`, per `SPEC_FULL.md` §4.13.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default::rate_oracle_static_rate")]
    pub static_rate: f64,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::rate_oracle_timeout")]
    pub timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::rate_oracle_cache_ttl")]
    pub cache_ttl: Duration,
}

impl Default for RateOracleConfig {
    fn default() -> Self {
        Self {
            url: None,
            static_rate: default::rate_oracle_static_rate(),
            timeout: default::rate_oracle_timeout(),
            cache_ttl: default::rate_oracle_cache_ttl(),
        }
    }
}

/// Mirrors `crate::pool::PoolConfig`; kept distinct so the domain struct
/// doesn't carry config-layer concerns. Converted in `crate::app`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::reuse_window")]
    pub reuse_window: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::reuse_window_fallback")]
    pub reuse_window_fallback: Duration,

    #[serde(default = "default::refill_threshold")]
    pub refill_threshold: usize,

    #[serde(default = "default::max_pool_size")]
    pub max_pool_size: usize,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::refill_cooldown")]
    pub refill_cooldown: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            reuse_window: default::reuse_window(),
            reuse_window_fallback: default::reuse_window_fallback(),
            refill_threshold: default::refill_threshold(),
            max_pool_size: default::max_pool_size(),
            refill_cooldown: default::refill_cooldown(),
        }
    }
}

impl From<PoolSettings> for crate::pool::PoolConfig {
    fn from(s: PoolSettings) -> Self {
        Self {
            reuse_window: s.reuse_window,
            reuse_window_fallback: s.reuse_window_fallback,
            refill_threshold: s.refill_threshold,
            max_pool_size: s.max_pool_size,
            refill_cooldown: s.refill_cooldown,
        }
    }
}

/// Mirrors `crate::gap_limit::GapLimitConfig`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GapLimitSettings {
    #[serde(default = "default::max_gap")]
    pub max_gap: u64,
    #[serde(default = "default::warn_ratio")]
    pub warn_ratio: f64,
    #[serde(default = "default::critical_ratio")]
    pub critical_ratio: f64,
}

impl Default for GapLimitSettings {
    fn default() -> Self {
        Self {
            max_gap: default::max_gap(),
            warn_ratio: default::warn_ratio(),
            critical_ratio: default::critical_ratio(),
        }
    }
}

impl From<GapLimitSettings> for crate::gap_limit::GapLimitConfig {
    fn from(s: GapLimitSettings) -> Self {
        Self { max_gap: s.max_gap, warn_ratio: s.warn_ratio, critical_ratio: s.critical_ratio }
    }
}

/// Mirrors `crate::observer::ObserverConfig`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObserverSettings {
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::fast_tick")]
    pub fast_tick: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::slow_tick")]
    pub slow_tick: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::observer_deadline")]
    pub deadline: Duration,

    #[serde(default = "default::max_concurrent")]
    pub max_concurrent: usize,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::notification_hook_timeout")]
    pub notification_hook_timeout: Duration,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            fast_tick: default::fast_tick(),
            slow_tick: default::slow_tick(),
            deadline: default::observer_deadline(),
            max_concurrent: default::max_concurrent(),
            notification_hook_timeout: default::notification_hook_timeout(),
        }
    }
}

impl From<ObserverSettings> for crate::observer::ObserverConfig {
    fn from(s: ObserverSettings) -> Self {
        Self {
            fast_tick: s.fast_tick,
            slow_tick: s.slow_tick,
            deadline: s.deadline,
            max_concurrent: s.max_concurrent,
            notification_hook_timeout: s.notification_hook_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub secret: Secret<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Bearer token guarding `/admin/*`. Unset disables the admin surface
    /// entirely (every admin route returns 404).
    #[serde(default)]
    pub token: Option<Secret<String>>,
}

/// Per-provider rate-limiter and circuit-breaker limits, keyed by provider
/// name. These are protocol constants enumerated in `SPEC_FULL.md` §6 rather
/// than operator-tunable settings; `crate::app` builds them directly instead
/// of sourcing them from `Config`. Kept here only as the documented anchor
/// for that table so a reader looking for "where do the §6 numbers live"
/// finds this comment.
pub type ProviderLimitsTable = HashMap<&'static str, (u32, Duration, Duration, u32, Duration)>;

pub mod default {
    use std::time::Duration;

    use super::{BlockCypherConfig, ProviderEndpointConfig};

    pub fn data_dir() -> std::path::PathBuf {
        std::path::PathBuf::from("./data")
    }

    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn shutdown_delay() -> Duration {
        Duration::from_secs(1)
    }

    pub fn request_timeout() -> Duration {
        Duration::from_secs(15)
    }

    pub fn wallet_provider_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn provider_timeout() -> Duration {
        Duration::from_secs(15)
    }

    pub fn mempoolspace() -> ProviderEndpointConfig {
        ProviderEndpointConfig { base_url: "https://mempool.space".to_owned(), timeout: provider_timeout() }
    }

    pub fn blockstream() -> ProviderEndpointConfig {
        ProviderEndpointConfig { base_url: "https://blockstream.info".to_owned(), timeout: provider_timeout() }
    }

    pub fn trezor() -> ProviderEndpointConfig {
        ProviderEndpointConfig { base_url: "https://btc1.trezor.io".to_owned(), timeout: provider_timeout() }
    }

    pub fn blockchain() -> ProviderEndpointConfig {
        ProviderEndpointConfig { base_url: "https://blockchain.info".to_owned(), timeout: provider_timeout() }
    }

    pub fn blockcypher() -> BlockCypherConfig {
        BlockCypherConfig {
            base_url: "https://api.blockcypher.com".to_owned(),
            token: None,
            timeout: provider_timeout(),
        }
    }

    pub fn blockonomics() -> ProviderEndpointConfig {
        ProviderEndpointConfig { base_url: "https://www.blockonomics.co".to_owned(), timeout: provider_timeout() }
    }

    pub fn rate_oracle_static_rate() -> f64 {
        0.0
    }

    pub fn rate_oracle_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn rate_oracle_cache_ttl() -> Duration {
        Duration::from_secs(10)
    }

    pub fn reuse_window() -> Duration {
        Duration::from_secs(72 * 3600)
    }

    pub fn reuse_window_fallback() -> Duration {
        Duration::from_secs(24 * 3600)
    }

    pub fn refill_threshold() -> usize {
        3
    }

    pub fn max_pool_size() -> usize {
        20
    }

    pub fn refill_cooldown() -> Duration {
        Duration::from_secs(5 * 60)
    }

    pub fn max_gap() -> u64 {
        20
    }

    pub fn warn_ratio() -> f64 {
        0.70
    }

    pub fn critical_ratio() -> f64 {
        0.85
    }

    pub fn fast_tick() -> Duration {
        Duration::from_secs(15)
    }

    pub fn slow_tick() -> Duration {
        Duration::from_secs(60)
    }

    pub fn observer_deadline() -> Duration {
        Duration::from_secs(30 * 60)
    }

    pub fn max_concurrent() -> usize {
        500
    }

    pub fn notification_hook_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn balance_cache_ttl() -> Duration {
        Duration::from_secs(15)
    }

    pub fn network_call_deadline() -> Duration {
        Duration::from_secs(15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `std::env::set_var` mutates process-global state; serialize the tests
    // that touch it the same way the teacher's config tests do.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn base_toml() -> &'static str {
        indoc::indoc! {r#"
            [server]
            address = "0.0.0.0:8080"

            [wallet_provider]
            base_url = "https://wallet.example.com"
            api_key = "wallet-key"

            [providers.mempoolspace]
            base_url = "https://mempool.space"

            [providers.blockstream]
            base_url = "https://blockstream.info"

            [providers.trezor]
            base_url = "https://btc1.trezor.io"

            [providers.blockchain]
            base_url = "https://blockchain.info"

            [providers.blockcypher]
            base_url = "https://api.blockcypher.com"

            [providers.blockonomics]
            base_url = "https://www.blockonomics.co"

            [webhook]
            secret = "shh"
        "#}
    }

    #[test]
    fn toml_parses_directly_without_the_config_crate() {
        // `load_config` goes through `config::Config::builder()` for layered
        // env/file merging, but the file itself must also be plain valid TOML
        // that `toml` can parse and re-emit on its own.
        let config: Config = toml::from_str(base_toml()).unwrap();
        assert_eq!(config.webhook.secret.expose(), "shh");
        let reserialized = toml::to_string_pretty(&config).unwrap();
        let reparsed: Config = toml::from_str(&reserialized).unwrap();
        similar_asserts::assert_eq!(
            serde_json::to_string_pretty(&config).unwrap(),
            serde_json::to_string_pretty(&reparsed).unwrap(),
        );
    }

    #[test]
    fn minimal_toml_fills_in_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, base_toml()).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.address.to_string(), "0.0.0.0:8080");
        assert_eq!(config.pool.max_pool_size, 20);
        assert_eq!(config.gap_limit.max_gap, 20);
        assert_eq!(config.observer.deadline, Duration::from_secs(30 * 60));
        assert!(config.rate_oracle.url.is_none());
        assert!(config.admin.token.is_none());
    }

    #[test]
    fn env_vars_override_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, base_toml()).unwrap();

        std::env::set_var("MON__POOL__MAX_POOL_SIZE", "42");
        let config = load_config(Some(&path)).unwrap();
        std::env::remove_var("MON__POOL__MAX_POOL_SIZE");

        assert_eq!(config.pool.max_pool_size, 42);
    }

    #[test]
    fn legacy_alias_sets_max_concurrent() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, base_toml()).unwrap();

        std::env::set_var("MAX_GOROUTINES", "7");
        let config = load_config(Some(&path)).unwrap();
        std::env::remove_var("MAX_GOROUTINES");

        assert_eq!(config.observer.max_concurrent, 7);
    }

    #[test]
    fn prefixed_env_wins_over_legacy_alias() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, base_toml()).unwrap();

        std::env::set_var("MAX_GOROUTINES", "7");
        std::env::set_var("MON__OBSERVER__MAX_CONCURRENT", "9");
        let config = load_config(Some(&path)).unwrap();
        std::env::remove_var("MAX_GOROUTINES");
        std::env::remove_var("MON__OBSERVER__MAX_CONCURRENT");

        assert_eq!(config.observer.max_concurrent, 9);
    }
}
