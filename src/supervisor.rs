//! Lifecycle supervisor: the recurring background maintenance that keeps
//! pool state, on-disk snapshots, observer bookkeeping, and subscriber
//! fanout consistent over time, independent of any single request. See
//! `SPEC_FULL.md` §4.12.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::App;
use crate::utils::spawn_with_backoff_cancel_on_shutdown;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const REPORT_INTERVAL: Duration = Duration::from_secs(60 * 60);
const AUDIT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const AUDIT_PACING: Duration = Duration::from_secs(1);
const RESTART_BACKOFF: Duration = Duration::from_secs(10);

/// How long a confirmed address sits before its fanout subscriptions are
/// closed. Long enough that every subscriber has had time to receive the
/// terminal event even over a slow connection.
fn fanout_idle_grace() -> chrono::Duration {
    chrono::Duration::minutes(10)
}

/// Owns the three periodic loops (sweep, hourly report, daily audit) that
/// run for the lifetime of the process. `start` spawns them and returns
/// their handles; the caller awaits those handles during shutdown the same
/// way it awaits the HTTP server's.
pub struct Supervisor {
    app: Arc<App>,
}

impl Supervisor {
    #[must_use]
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    #[must_use]
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![
            spawn_with_backoff_cancel_on_shutdown(
                {
                    let app = self.app.clone();
                    move || sweep_loop(app.clone())
                },
                RESTART_BACKOFF,
                self.app.shutdown.clone(),
            ),
            spawn_with_backoff_cancel_on_shutdown(
                {
                    let app = self.app.clone();
                    move || report_loop(app.clone())
                },
                RESTART_BACKOFF,
                self.app.shutdown.clone(),
            ),
            spawn_with_backoff_cancel_on_shutdown(
                {
                    let app = self.app.clone();
                    move || audit_loop(app.clone())
                },
                RESTART_BACKOFF,
                self.app.shutdown.clone(),
            ),
        ]
    }
}

/// Every 5 minutes: recycle expired reservations, persist dirty snapshots,
/// retire stale observer cancel handles, and close fanout subscriptions for
/// addresses confirmed long enough ago that nothing more will ever be
/// published for them.
async fn sweep_loop(app: Arc<App>) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = sweep_once(&app).await {
            warn!(error = %e, "lifecycle sweep failed");
        }
    }
}

async fn sweep_once(app: &Arc<App>) -> anyhow::Result<()> {
    let pools = app.pool_registry.all_pools().await;
    let cutoff = Utc::now() - fanout_idle_grace();

    for pool in &pools {
        let recycled = pool.recycle_expired().await;
        if recycled > 0 {
            info!(site = pool.site(), recycled, "recycled expired reservations");
        }

        for address in pool.used_addresses_before(cutoff).await {
            app.fanout.close_address(&address).await;
        }

        let stats = pool.stats().await;
        app.gap_limit.reconcile(stats.total_generated, stats.used as u64).await;
    }

    app.pool_registry.persist_dirty().await?;
    app.prune_observer_cancels().await;
    Ok(())
}

/// Hourly: log per-site pool totals and gap-limit pressure.
async fn report_loop(app: Arc<App>) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        report_once(&app).await;
    }
}

async fn report_once(app: &Arc<App>) {
    let (paid, unpaid, consecutive_failures) = app.gap_limit.pressure_summary().await;
    info!(paid, unpaid, consecutive_failures, "gap limit status");

    for pool in app.pool_registry.all_pools().await {
        let stats = pool.stats().await;
        info!(
            site = pool.site(),
            available = stats.available,
            reserved = stats.reserved,
            used = stats.used,
            total_generated = stats.total_generated,
            recycled = stats.recycled,
            gap_errors = stats.gap_errors,
            "pool status"
        );
    }
}

/// Daily: re-check every known address's full payment history against the
/// chain, one call per second, so drift between pool state and the actual
/// chain is caught even if a webhook was missed or an observer task died
/// without marking an address Used.
async fn audit_loop(app: Arc<App>) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(AUDIT_INTERVAL);
    loop {
        ticker.tick().await;
        audit_once(&app).await;
    }
}

async fn audit_once(app: &Arc<App>) {
    let pools = app.pool_registry.all_pools().await;
    let mut checked = 0u64;
    let mut funded_unexpectedly = 0u64;

    for pool in &pools {
        for address in pool.all_addresses().await {
            tokio::time::sleep(AUDIT_PACING).await;
            checked += 1;

            match app.chain.check_history(&address).await {
                Ok((balance, tx_count)) if balance > 0 && !pool.is_reserved(&address).await => {
                    funded_unexpectedly += 1;
                    warn!(
                        site = pool.site(),
                        address, balance, tx_count, "audit: funded address not tracked as Reserved"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(site = pool.site(), address, error = %e, "audit: balance history check failed");
                }
            }
        }
    }

    info!(checked, funded_unexpectedly, "daily balance-history audit complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::shutdown::Shutdown;
    use std::time::Duration as StdDuration;

    fn test_config(data_dir: std::path::PathBuf) -> Config {
        Config {
            server: crate::config::ServerConfig {
                address: "127.0.0.1:0".parse().unwrap(),
                shutdown_timeout: StdDuration::from_secs(5),
                shutdown_delay: StdDuration::from_millis(10),
                request_timeout: StdDuration::from_secs(5),
            },
            wallet_provider: crate::config::WalletProviderConfig {
                base_url: "http://127.0.0.1:9".to_owned(),
                api_key: crate::secret::Secret::new("key".to_owned()),
                timeout: StdDuration::from_secs(1),
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
            balance_cache_ttl: StdDuration::from_secs(1),
            network_call_deadline: StdDuration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn sweep_once_persists_and_prunes_without_any_pools() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::spawn(StdDuration::from_secs(5), StdDuration::from_millis(10));
        let app = App::new(test_config(dir.path().to_path_buf()), shutdown).await.unwrap();
        sweep_once(&app).await.unwrap();
    }

    #[tokio::test]
    async fn report_once_does_not_panic_without_any_pools() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::spawn(StdDuration::from_secs(5), StdDuration::from_millis(10));
        let app = App::new(test_config(dir.path().to_path_buf()), shutdown).await.unwrap();
        report_once(&app).await;
    }

    #[tokio::test]
    async fn start_spawns_three_loops() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::spawn(StdDuration::from_millis(50), StdDuration::from_millis(10));
        let app = App::new(test_config(dir.path().to_path_buf()), shutdown.clone()).await.unwrap();
        let supervisor = Supervisor::new(app);
        let handles = supervisor.start();
        assert_eq!(handles.len(), 3);

        shutdown.shutdown();
        for handle in handles {
            tokio::time::timeout(StdDuration::from_secs(2), handle).await.unwrap().unwrap();
        }
    }
}
