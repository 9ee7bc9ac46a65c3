//! Composition root: wires every subsystem into one `App` and exposes the
//! handful of cross-cutting operations (`reserve`, webhook dispatch) that
//! need more than one collaborator at once.

pub mod error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{info, instrument};

use crate::balance_cache::BalanceCache;
use crate::chain::providers::{
    BlockCypherProvider, BlockbookProvider, BlockchainComProvider, BlockonomicsProvider, EsploraProvider,
};
use crate::chain::{BalanceProvider, ChainReader};
use crate::circuit_breaker::{CircuitBreaker, Limits as BreakerLimits};
use crate::config::Config;
use crate::confirmation_hook::{LoggingConfirmationHook, SharedConfirmationHook};
use crate::fanout::FanoutRegistry;
use crate::gap_limit::GapLimitMonitor;
use crate::observer::{self, CancelHandle, ObserverConfig, ObserverContext};
use crate::pool::{AddressPool, PoolRegistry};
use crate::rate_limiter::{Limits as RateLimits, RateLimiter};
use crate::rate_oracle::{HttpRateOracle, SharedRateOracle, StaticRateOracle};
use crate::session::SessionIndex;
use crate::shutdown::Shutdown;
use crate::wallet_provider::WalletProvider;
use crate::webhook::WebhookContext;

use error::Error;

/// Per-provider rate-limiter and circuit-breaker defaults from
/// `SPEC_FULL.md` §6. These are protocol constants, not operator knobs, so
/// they live in code rather than `Config`.
fn provider_limits() -> Vec<(&'static str, RateLimits, BreakerLimits)> {
    vec![
        (
            "mempoolspace",
            RateLimits { capacity: 60, window: Duration::from_secs(60), min_interval: Duration::from_secs(1) },
            BreakerLimits { max_failures: 4, reset_timeout: Duration::from_secs(60) },
        ),
        (
            "blockstream",
            RateLimits { capacity: 50, window: Duration::from_secs(60), min_interval: Duration::from_secs(1) },
            BreakerLimits { max_failures: 4, reset_timeout: Duration::from_secs(60) },
        ),
        (
            "trezor",
            RateLimits { capacity: 30, window: Duration::from_secs(60), min_interval: Duration::from_secs(2) },
            BreakerLimits { max_failures: 3, reset_timeout: Duration::from_secs(120) },
        ),
        (
            "blockchain",
            RateLimits { capacity: 10, window: Duration::from_secs(60), min_interval: Duration::from_secs(6) },
            BreakerLimits { max_failures: 5, reset_timeout: Duration::from_secs(120) },
        ),
        (
            "blockcypher",
            RateLimits { capacity: 20, window: Duration::from_secs(3600), min_interval: Duration::from_secs(180) },
            BreakerLimits { max_failures: 5, reset_timeout: Duration::from_secs(300) },
        ),
        (
            "blockonomics",
            RateLimits { capacity: 5, window: Duration::from_secs(60), min_interval: Duration::from_secs(12) },
            BreakerLimits { max_failures: 3, reset_timeout: Duration::from_secs(180) },
        ),
    ]
}

fn build_providers(config: &Config) -> Vec<Arc<dyn BalanceProvider>> {
    let p = &config.providers;
    vec![
        Arc::new(EsploraProvider::new("mempoolspace", p.mempoolspace.base_url.clone(), p.mempoolspace.timeout)),
        Arc::new(EsploraProvider::new("blockstream", p.blockstream.base_url.clone(), p.blockstream.timeout)),
        Arc::new(BlockbookProvider::new("trezor", p.trezor.base_url.clone(), p.trezor.timeout)),
        Arc::new(BlockchainComProvider::new(p.blockchain.base_url.clone(), p.blockchain.timeout)),
        Arc::new(BlockCypherProvider::new(
            p.blockcypher.base_url.clone(),
            p.blockcypher.token.clone(),
            p.blockcypher.timeout,
        )),
        Arc::new(BlockonomicsProvider::new(p.blockonomics.base_url.clone(), p.blockonomics.timeout)),
    ]
}

/// Every subsystem the core needs, composed once at startup and shared
/// behind `Arc` for the lifetime of the process.
pub struct App {
    pub config: Config,
    pub pool_registry: Arc<PoolRegistry>,
    pub chain: Arc<ChainReader>,
    pub gap_limit: Arc<GapLimitMonitor>,
    pub fanout: Arc<FanoutRegistry>,
    pub sessions: Arc<SessionIndex>,
    pub rate_oracle: SharedRateOracle,
    pub confirmation_hook: SharedConfirmationHook,
    pub shutdown: Shutdown,

    observer_config: ObserverConfig,
    observer_slots: Arc<Semaphore>,

    /// Cancel handles for in-flight observers, keyed by address, so a
    /// webhook confirmation can retire the matching poller. Pruned by the
    /// lifecycle supervisor once the address leaves Reserved.
    observer_cancels: Mutex<HashMap<String, CancelHandle>>,
}

impl App {
    /// # Errors
    ///
    /// Returns `Err` if the wallet provider client cannot be constructed
    /// (bad base URL or API key) or the data directory cannot be created.
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(config: Config, shutdown: Shutdown) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        if let Some(mb) = config.max_memory_mb {
            info!(max_memory_mb = mb, "legacy MAX_MEMORY_MB set; not enforced by this process");
        }

        let wallet_provider = Arc::new(WalletProvider::new(
            &config.wallet_provider.base_url,
            &config.wallet_provider.api_key,
            config.wallet_provider.timeout,
        )?);

        let providers = build_providers(&config);
        let limits = provider_limits();
        let limiter = RateLimiter::new(limits.iter().map(|(n, r, _)| ((*n).to_owned(), *r)));
        let breaker = CircuitBreaker::new(limits.iter().map(|(n, _, b)| ((*n).to_owned(), *b)));
        let cache = BalanceCache::new(config.balance_cache_ttl);

        let chain = Arc::new(ChainReader::new(
            providers,
            limiter,
            breaker,
            cache,
            config.static_fallback_address.clone(),
            config.network_call_deadline,
        ));

        let gap_limit = Arc::new(GapLimitMonitor::new(config.gap_limit.into()));

        let pool_registry = Arc::new(PoolRegistry::new(
            config.data_dir.clone(),
            config.pool.into(),
            wallet_provider,
            chain.clone(),
            gap_limit.clone(),
        ));

        let fanout = FanoutRegistry::new();
        let sessions = Arc::new(SessionIndex::new());

        let rate_oracle: SharedRateOracle = match &config.rate_oracle.url {
            Some(url) => Arc::new(HttpRateOracle::new(
                url.clone(),
                config.rate_oracle.timeout,
                config.rate_oracle.cache_ttl,
            )),
            None => Arc::new(StaticRateOracle(config.rate_oracle.static_rate)),
        };

        let confirmation_hook: SharedConfirmationHook = Arc::new(LoggingConfirmationHook);
        let observer_config: ObserverConfig = config.observer.into();
        let observer_slots = Arc::new(Semaphore::new(observer_config.max_concurrent));

        Ok(Arc::new(Self {
            config,
            pool_registry,
            chain,
            gap_limit,
            fanout,
            sessions,
            rate_oracle,
            confirmation_hook,
            shutdown,
            observer_config,
            observer_slots,
            observer_cancels: Mutex::new(HashMap::new()),
        }))
    }

    /// Builds a fresh `ObserverContext` for `pool`. Every field but `pool`
    /// is a clone of a shared collaborator; cheap to construct per call.
    fn observer_ctx(&self, pool: Arc<AddressPool>) -> Arc<ObserverContext> {
        Arc::new(ObserverContext {
            chain: self.chain.clone(),
            pool,
            gap_limit: self.gap_limit.clone(),
            fanout: self.fanout.clone(),
            sessions: self.sessions.clone(),
            rate_oracle: self.rate_oracle.clone(),
            confirmation_hook: self.confirmation_hook.clone(),
            slots: self.observer_slots.clone(),
            config: self.observer_config,
        })
    }

    /// Reserves an address for `customer` on `site`, registers it with the
    /// session index, and launches a polling observer for it. This is the
    /// composed C6+C11+C8 flow described in `SPEC_FULL.md` §2's data-flow
    /// paragraph; the external request-handling layer that calls it is out
    /// of the core's scope.
    #[instrument(level = "debug", skip(self))]
    pub async fn reserve(&self, site: &str, customer: &str, amount: f64, fast: bool) -> Result<String, Error> {
        let pool = self.pool_registry.pool(site).await?;
        let (address, _outcome) = pool.reserve(customer, amount).await?;

        self.sessions.record_generated(customer, &address).await;

        let ctx = self.observer_ctx(pool);
        if let Some(cancel) =
            observer::try_spawn(ctx, self.shutdown.clone(), site.to_owned(), address.clone(), customer.to_owned(), fast)
        {
            self.observer_cancels.lock().await.insert(address.clone(), cancel);
        }

        Ok(address)
    }

    /// Builds a `WebhookContext` for `site`. Cheap but not infallible: it
    /// resolves (and lazily creates) that site's pool.
    pub async fn webhook_context(&self, site: &str) -> Result<WebhookContext, Error> {
        let pool = self.pool_registry.pool(site).await?;
        Ok(WebhookContext {
            pool,
            gap_limit: self.gap_limit.clone(),
            fanout: self.fanout.clone(),
            sessions: self.sessions.clone(),
            rate_oracle: self.rate_oracle.clone(),
            confirmation_hook: self.confirmation_hook.clone(),
            notification_hook_timeout: self.observer_config.notification_hook_timeout,
            site: site.to_owned(),
        })
    }

    /// Returns the cancel handle tracked for `address`, if an observer is
    /// currently polling it. Passed into `webhook::handle` so a push
    /// confirmation can retire the matching poller.
    pub async fn cancel_handle_for(&self, address: &str) -> Option<CancelHandle> {
        self.observer_cancels.lock().await.get(address).cloned()
    }

    /// Cancels and drops the observer tracked for any address that is no
    /// longer Reserved in any pool, so a stale poller doesn't keep running
    /// for the remainder of its deadline after the address was recycled or
    /// confirmed some other way. Called by the lifecycle supervisor's
    /// 5-minute sweep.
    pub async fn prune_observer_cancels(&self) {
        let mut cancels = self.observer_cancels.lock().await;
        if cancels.is_empty() {
            return;
        }

        let pools = self.pool_registry.all_pools().await;
        let mut stale = Vec::new();
        for address in cancels.keys() {
            let mut still_reserved = false;
            for pool in &pools {
                if pool.is_reserved(address).await {
                    still_reserved = true;
                    break;
                }
            }
            if !still_reserved {
                stale.push(address.clone());
            }
        }

        for address in stale {
            if let Some(cancel) = cancels.remove(&address) {
                cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(data_dir: std::path::PathBuf) -> Config {
        Config {
            server: crate::config::ServerConfig {
                address: "127.0.0.1:0".parse().unwrap(),
                shutdown_timeout: Duration::from_secs(5),
                shutdown_delay: Duration::from_millis(10),
                request_timeout: Duration::from_secs(5),
            },
            wallet_provider: crate::config::WalletProviderConfig {
                base_url: "http://127.0.0.1:9".to_owned(),
                api_key: crate::secret::Secret::new("key".to_owned()),
                timeout: Duration::from_secs(1),
            },
            providers: crate::config::ProvidersConfig::default(),
            rate_oracle: crate::config::RateOracleConfig { static_rate: 50_000.0, ..Default::default() },
            pool: crate::config::PoolSettings::default(),
            gap_limit: crate::config::GapLimitSettings::default(),
            observer: crate::config::ObserverSettings::default(),
            webhook: crate::config::WebhookConfig { secret: crate::secret::Secret::new("shh".to_owned()) },
            admin: crate::config::AdminConfig::default(),
            data_dir,
            static_fallback_address: None,
            max_memory_mb: None,
            balance_cache_ttl: Duration::from_secs(1),
            network_call_deadline: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn app_constructs_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::spawn(Duration::from_secs(5), Duration::from_millis(10));
        let app = App::new(test_config(dir.path().to_path_buf()), shutdown).await.unwrap();
        assert_eq!(app.rate_oracle.btc_usd().await.unwrap(), 50_000.0);
    }

    #[tokio::test]
    async fn prune_observer_cancels_is_a_noop_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::spawn(Duration::from_secs(5), Duration::from_millis(10));
        let app = App::new(test_config(dir.path().to_path_buf()), shutdown).await.unwrap();
        app.prune_observer_cancels().await;
    }
}
