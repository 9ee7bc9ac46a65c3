//! Per-site address inventory: reservation, reuse, recycling, and emergency
//! synthesis against the upstream wallet provider. See `SPEC_FULL.md` §4.6.

pub mod snapshot;
pub mod types;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::chain::ChainReader;
use crate::gap_limit::GapLimitMonitor;
use crate::wallet_provider::{self, WalletProvider};
use snapshot::Snapshot;
use types::{AddressRecord, PoolStats, ReserveOutcome, Status};

#[derive(Debug, Error)]
pub enum Error {
    #[error("address pool exhausted: inventory empty and synthesis failed")]
    PoolExhausted,
    #[error("upstream wallet provider hit its gap limit")]
    GapLimit,
    #[error("balance verification failed while synthesizing an address: {0}")]
    ChainError(#[from] crate::chain::Error),
}

const EMERGENCY_SYNTHESIS_ATTEMPTS: usize = 3;
const SYNTHESIS_PACING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub reuse_window: Duration,
    pub reuse_window_fallback: Duration,
    pub refill_threshold: usize,
    pub max_pool_size: usize,
    pub refill_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reuse_window: Duration::from_secs(72 * 3600),
            reuse_window_fallback: Duration::from_secs(24 * 3600),
            refill_threshold: 3,
            max_pool_size: 20,
            refill_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

struct Inner {
    available: VecDeque<AddressRecord>,
    reserved: HashMap<String, AddressRecord>,
    used: HashMap<String, AddressRecord>,
    customer_to_address: HashMap<String, String>,
    next_index: u32,
    stats: PoolStats,
    last_refill_attempt: Option<DateTime<Utc>>,
}

/// One site's address inventory. Mutations happen under a single mutex;
/// network calls to the wallet provider and chain reader happen before or
/// after the lock is held, never while it is held.
pub struct AddressPool {
    site: String,
    config: PoolConfig,
    inner: Mutex<Inner>,
    wallet_provider: Arc<WalletProvider>,
    chain: Arc<ChainReader>,
    gap_limit: Arc<GapLimitMonitor>,
    dirty: AtomicBool,
}

impl AddressPool {
    #[must_use]
    pub fn new(
        site: String,
        config: PoolConfig,
        snapshot: Snapshot,
        wallet_provider: Arc<WalletProvider>,
        chain: Arc<ChainReader>,
        gap_limit: Arc<GapLimitMonitor>,
    ) -> Self {
        let mut customer_to_address = HashMap::new();
        for record in snapshot.reserved.values() {
            if let Some(customer) = &record.reserved_for {
                customer_to_address.insert(customer.clone(), record.address.clone());
            }
        }

        let inner = Inner {
            available: snapshot.available.into(),
            reserved: snapshot.reserved,
            used: snapshot.used,
            customer_to_address,
            next_index: snapshot.next_index,
            stats: snapshot.stats,
            last_refill_attempt: None,
        };

        Self {
            site,
            config,
            inner: Mutex::new(inner),
            wallet_provider,
            chain,
            gap_limit,
            dirty: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn site(&self) -> &str {
        &self.site
    }

    /// Whether state has changed since the last `snapshot()` call. The
    /// supervisor polls this before bothering to serialize and write.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Produces a point-in-time snapshot for the supervisor to persist.
    /// Clears the dirty flag.
    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().await;
        self.dirty.store(false, Ordering::SeqCst);
        Snapshot {
            available: inner.available.iter().cloned().collect(),
            reserved: inner.reserved.clone(),
            used: inner.used.clone(),
            stats: inner.stats.clone(),
            next_index: inner.next_index,
            unknown_fields: serde_json::Map::new(),
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            available: inner.available.len(),
            reserved: inner.reserved.len(),
            used: inner.used.len(),
            ..inner.stats.clone()
        }
    }

    /// Whether `address` is still Reserved. Used by the lifecycle supervisor
    /// to notice an observer task that is polling for an address the pool no
    /// longer considers outstanding (already recycled or confirmed through
    /// another path) so it can stop tracking its cancel handle.
    pub async fn is_reserved(&self, address: &str) -> bool {
        self.inner.lock().await.reserved.contains_key(address)
    }

    /// Reserves an address for `customer`. See `SPEC_FULL.md` §4.6 for the
    /// reuse / available-queue / emergency-synthesis policy this implements.
    #[instrument(level = "debug", skip(self))]
    pub async fn reserve(&self, customer: &str, amount: f64) -> Result<(String, ReserveOutcome), Error> {
        {
            let mut inner = self.inner.lock().await;
            let window = self.reuse_window(&inner.stats).await;

            if let Some(address) = inner.customer_to_address.get(customer).cloned() {
                if let Some(record) = inner.reserved.get_mut(&address) {
                    let age = Utc::now().signed_duration_since(record.reserved_at.unwrap_or_else(Utc::now));
                    if age.to_std().unwrap_or(Duration::MAX) < window {
                        record.reserved_at = Some(Utc::now());
                        record.amount = Some(amount);
                        self.mark_dirty();
                        return Ok((address, ReserveOutcome::Reused));
                    }
                }
            }

            while let Some(mut record) = inner.available.pop_front() {
                // Defensive: an Available entry should never also be in Used,
                // but a stale snapshot or a racing recycle could leave one
                // behind. Discard it rather than re-reserving an address
                // that's already been paid.
                if inner.used.contains_key(&record.address) {
                    warn!(address = record.address, "discarding available address that is already Used");
                    self.mark_dirty();
                    continue;
                }

                record.reserve(customer);
                record.amount = Some(amount);
                let address = record.address.clone();
                inner.customer_to_address.insert(customer.to_owned(), address.clone());
                inner.reserved.insert(address.clone(), record);
                self.mark_dirty();
                return Ok((address, ReserveOutcome::FromAvailable));
            }
        }

        match self.synthesize_one(customer, amount).await {
            Ok(address) => Ok((address, ReserveOutcome::Synthesized)),
            Err(e) => Err(e),
        }
    }

    async fn reuse_window(&self, stats: &PoolStats) -> Duration {
        let unpaid = stats.available as u64 + stats.reserved as u64;
        if self.gap_limit.should_use_fallback(unpaid).await {
            self.config.reuse_window_fallback
        } else {
            self.config.reuse_window
        }
    }

    /// Generates, balance-verifies, and reserves a single fresh address.
    /// Retries up to `EMERGENCY_SYNTHESIS_ATTEMPTS` times if a generated
    /// address turns out to already be funded (the upstream wallet recycling
    /// a funded address under gap-limit pressure).
    async fn synthesize_one(&self, customer: &str, amount: f64) -> Result<String, Error> {
        for _ in 0..EMERGENCY_SYNTHESIS_ATTEMPTS {
            match self.generate_clean_address(customer).await {
                Ok(mut record) => {
                    record.reserve(customer);
                    record.amount = Some(amount);
                    let address = record.address.clone();

                    let mut inner = self.inner.lock().await;
                    inner.customer_to_address.insert(customer.to_owned(), address.clone());
                    inner.reserved.insert(address.clone(), record);
                    inner.stats.total_generated += 1;
                    drop(inner);

                    self.gap_limit.on_address_generated().await;
                    self.mark_dirty();
                    return Ok(address);
                }
                Err(GenerateError::Funded) => {
                    self.gap_limit
                        .on_gap_error(customer, "generated address already funded")
                        .await;
                    let mut inner = self.inner.lock().await;
                    inner.stats.gap_errors += 1;
                    continue;
                }
                Err(GenerateError::GapLimit) => {
                    self.gap_limit.on_gap_error(customer, "upstream gap limit").await;
                    let mut inner = self.inner.lock().await;
                    inner.stats.gap_errors += 1;
                    inner.stats.last_error = Some("upstream gap limit".to_owned());
                    return Err(Error::GapLimit);
                }
                Err(GenerateError::Provider(msg)) => {
                    let mut inner = self.inner.lock().await;
                    inner.stats.last_error = Some(msg);
                }
            }
        }

        Err(Error::PoolExhausted)
    }

    async fn generate_clean_address(&self, customer: &str) -> Result<AddressRecord, GenerateError> {
        // The nonce keeps repeat emergency-synthesis/refill calls (which reuse
        // the same site/customer pair) from sharing a label the upstream
        // wallet might treat as an idempotency key.
        let nonce: u32 = rand::Rng::gen(&mut rand::thread_rng());
        let label = format!("{}-{customer}-{nonce:08x}", self.site);
        let address = self
            .wallet_provider
            .generate_address(&label, 0.0)
            .await
            .map_err(|e| match e {
                wallet_provider::Error::GapLimit => GenerateError::GapLimit,
                wallet_provider::Error::Provider(msg) => GenerateError::Provider(msg),
            })?;

        let balance = self.chain.balance_fresh(&address).await?;
        if balance > 0 {
            warn!(address, "generated address is already funded, treating as gap-limit pressure");
            return Err(GenerateError::Funded);
        }

        let index = {
            let mut inner = self.inner.lock().await;
            let index = inner.next_index;
            inner.next_index += 1;
            index
        };

        Ok(AddressRecord::new_available(address, index))
    }

    /// Transitions `address` from Reserved to Used. Returns `true` if this
    /// call performed the transition; `false` if the address was not (or no
    /// longer) Reserved, meaning a racing caller already won.
    #[instrument(level = "debug", skip(self))]
    pub async fn mark_used(&self, address: &str, customer: &str, amount: f64) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(mut record) = inner.reserved.remove(address) else {
            return false;
        };

        record.mark_used(customer, amount);
        inner.used.insert(address.to_owned(), record);
        inner.stats.used += 1;
        self.mark_dirty();
        true
    }

    /// Every address this pool currently knows about, in any state. Used by
    /// the lifecycle supervisor's periodic balance-history audit.
    pub async fn all_addresses(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .available
            .iter()
            .map(|r| r.address.clone())
            .chain(inner.reserved.keys().cloned())
            .chain(inner.used.keys().cloned())
            .collect()
    }

    /// Used addresses whose confirmation happened before `cutoff`. The
    /// supervisor closes fanout subscriptions for these: the terminal event
    /// has had time to reach every subscriber, so nothing more will ever be
    /// published for them.
    pub async fn used_addresses_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .used
            .values()
            .filter(|r| r.used_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|r| r.address.clone())
            .collect()
    }

    /// Admin operation: returns a Reserved address to Available.
    pub async fn release(&self, address: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(mut record) = inner.reserved.remove(address) else {
            return false;
        };
        record.release();
        if let Some(customer) = record.reserved_for.take() {
            inner.customer_to_address.remove(&customer);
        }
        inner.available.push_back(record);
        self.mark_dirty();
        true
    }

    /// Sweeps Reserved addresses older than the active reuse window: funded
    /// ones become Used (late payment capture), unfunded ones go back to
    /// Available. Balance checks bypass the cache so a recycle never acts on
    /// stale data. A balance-check failure is treated as "possibly funded"
    /// and the address is left Reserved.
    pub async fn recycle_expired(&self) -> u64 {
        let window = {
            let inner = self.inner.lock().await;
            self.reuse_window(&inner.stats).await
        };

        let candidates: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .reserved
                .values()
                .filter(|r| {
                    r.reserved_at
                        .map(|t| Utc::now().signed_duration_since(t).to_std().unwrap_or(Duration::MAX) >= window)
                        .unwrap_or(false)
                })
                .map(|r| r.address.clone())
                .collect()
        };

        let mut recycled = 0u64;
        for address in candidates {
            match self.chain.balance_fresh(&address).await {
                Ok(balance) if balance > 0 => {
                    let captured = {
                        let mut inner = self.inner.lock().await;
                        if let Some(mut record) = inner.reserved.remove(&address) {
                            let customer = record.reserved_for.clone().unwrap_or_default();
                            record.mark_used(&customer, 0.0);
                            inner.used.insert(address.clone(), record);
                            inner.stats.used += 1;
                            self.mark_dirty();
                            true
                        } else {
                            false
                        }
                    };
                    if captured {
                        // Late payment: never observed by an in-process observer or
                        // webhook, so the monitor's paid/unpaid counters never saw it.
                        self.gap_limit.on_payment().await;
                    }
                }
                Ok(_) => {
                    let mut inner = self.inner.lock().await;
                    if let Some(mut record) = inner.reserved.remove(&address) {
                        if let Some(customer) = record.reserved_for.take() {
                            inner.customer_to_address.remove(&customer);
                        }
                        record.release();
                        inner.available.push_back(record);
                        inner.stats.recycled += 1;
                        recycled += 1;
                        self.mark_dirty();
                    }
                }
                Err(e) => {
                    warn!(address, error = %e, "recycle balance check failed, leaving address reserved");
                }
            }
        }

        recycled
    }

    /// Tops up the available queue up to `max_pool_size`, honoring the
    /// refill cooldown and aborting after repeated failures.
    pub async fn refill_if_needed(&self) {
        let (needs_refill, target) = {
            let mut inner = self.inner.lock().await;
            let outstanding = inner.available.len() + inner.reserved.len();
            let needs = inner.available.len() <= self.config.refill_threshold
                && inner
                    .last_refill_attempt
                    .map(|t| Utc::now().signed_duration_since(t).to_std().unwrap_or(Duration::MAX) >= self.config.refill_cooldown)
                    .unwrap_or(true);

            if needs {
                inner.last_refill_attempt = Some(Utc::now());
            }

            (needs, self.config.max_pool_size.saturating_sub(outstanding))
        };

        if !needs_refill {
            return;
        }

        let mut consecutive_failures = 0u32;
        for _ in 0..target {
            match self.generate_clean_address("__refill__").await {
                Ok(record) => {
                    let mut inner = self.inner.lock().await;
                    inner.available.push_back(record);
                    inner.stats.total_generated += 1;
                    drop(inner);
                    self.gap_limit.on_address_generated().await;
                    self.mark_dirty();
                    consecutive_failures = 0;
                    tokio::time::sleep(SYNTHESIS_PACING).await;
                }
                Err(GenerateError::GapLimit) => {
                    self.gap_limit.on_gap_error("__refill__", "upstream gap limit during refill").await;
                    let mut inner = self.inner.lock().await;
                    inner.stats.last_error = Some("upstream gap limit during refill".to_owned());
                    break;
                }
                Err(_) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= 3 {
                        break;
                    }
                }
            }
        }
    }
}

enum GenerateError {
    GapLimit,
    Funded,
    Provider(String),
}

impl From<crate::chain::Error> for GenerateError {
    fn from(e: crate::chain::Error) -> Self {
        GenerateError::Provider(e.to_string())
    }
}

/// Owns one `AddressPool` per site, created lazily on first use. See the
/// Open Question decision in `SPEC_FULL.md` §9 / `DESIGN.md`.
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, Arc<AddressPool>>>,
    data_dir: PathBuf,
    config: PoolConfig,
    wallet_provider: Arc<WalletProvider>,
    chain: Arc<ChainReader>,
    gap_limit: Arc<GapLimitMonitor>,
}

impl PoolRegistry {
    #[must_use]
    pub fn new(
        data_dir: PathBuf,
        config: PoolConfig,
        wallet_provider: Arc<WalletProvider>,
        chain: Arc<ChainReader>,
        gap_limit: Arc<GapLimitMonitor>,
    ) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            data_dir,
            config,
            wallet_provider,
            chain,
            gap_limit,
        }
    }

    fn snapshot_path(&self, site: &str) -> PathBuf {
        self.data_dir.join(format!("pool-{site}.json"))
    }

    pub async fn pool(&self, site: &str) -> anyhow::Result<Arc<AddressPool>> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(site) {
            return Ok(pool.clone());
        }

        let snapshot = Snapshot::load(&self.snapshot_path(site)).await?;
        let pool = Arc::new(AddressPool::new(
            site.to_owned(),
            self.config,
            snapshot,
            self.wallet_provider.clone(),
            self.chain.clone(),
            self.gap_limit.clone(),
        ));
        pools.insert(site.to_owned(), pool.clone());
        Ok(pool)
    }

    pub async fn all_pools(&self) -> Vec<Arc<AddressPool>> {
        self.pools.lock().await.values().cloned().collect()
    }

    pub async fn persist_dirty(&self) -> anyhow::Result<()> {
        for pool in self.all_pools().await {
            if pool.is_dirty() {
                let snapshot = pool.snapshot().await;
                snapshot.save(&self.snapshot_path(pool.site())).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::providers::{BalanceProvider, ProviderError};
    use crate::circuit_breaker;
    use crate::gap_limit::GapLimitConfig;
    use crate::rate_limiter::{Limits as RateLimits, RateLimiter};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    struct StubProvider {
        balances: Mutex<HashMap<String, u64>>,
        default_balance: AtomicU64,
    }

    #[async_trait]
    impl BalanceProvider for StubProvider {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn balance(&self, address: &str) -> Result<u64, ProviderError> {
            let balances = self.balances.lock().await;
            Ok(*balances.get(address).unwrap_or(&self.default_balance.load(Ordering::SeqCst)))
        }

        async fn history(&self, address: &str) -> Result<(u64, u64), ProviderError> {
            Ok((self.balance(address).await?, 0))
        }
    }

    fn test_breaker() -> crate::circuit_breaker::CircuitBreaker {
        crate::circuit_breaker::CircuitBreaker::new([(
            "stub".to_owned(),
            circuit_breaker::Limits { max_failures: 100, reset_timeout: Duration::from_secs(60) },
        )])
    }

    fn test_chain(default_balance: u64) -> Arc<ChainReader> {
        let provider: Arc<dyn BalanceProvider> = Arc::new(StubProvider {
            balances: Mutex::new(HashMap::new()),
            default_balance: AtomicU64::new(default_balance),
        });
        Arc::new(ChainReader::new(
            vec![provider],
            RateLimiter::new([(
                "stub".to_owned(),
                RateLimits { capacity: 1000, window: Duration::from_secs(1), min_interval: Duration::ZERO },
            )]),
            test_breaker(),
            crate::balance_cache::BalanceCache::new(Duration::from_secs(1)),
            None,
            Duration::from_secs(5),
        ))
    }

    fn test_gap_limit() -> Arc<GapLimitMonitor> {
        Arc::new(GapLimitMonitor::new(GapLimitConfig::default()))
    }

    async fn make_pool_with_available(address_count: usize, balance: u64) -> (Arc<AddressPool>, Arc<ChainReader>) {
        let chain = test_chain(balance);
        let gap_limit = test_gap_limit();
        let wallet = Arc::new(
            WalletProvider::new("http://127.0.0.1:0/", &crate::secret::Secret::new("x".to_owned()), Duration::from_secs(1))
                .unwrap(),
        );

        let mut snapshot = Snapshot::default();
        for i in 0..address_count {
            snapshot
                .available
                .push(AddressRecord::new_available(format!("addr-{i}"), i as u32));
        }
        snapshot.next_index = address_count as u32;

        let pool = Arc::new(AddressPool::new(
            "site".to_owned(),
            PoolConfig::default(),
            snapshot,
            wallet,
            chain.clone(),
            gap_limit,
        ));
        (pool, chain)
    }

    #[tokio::test]
    async fn reserve_pops_from_available_then_reuses() {
        let (pool, _chain) = make_pool_with_available(2, 0).await;

        let (addr1, outcome1) = pool.reserve("cust-a", 10.0).await.unwrap();
        assert_eq!(outcome1, ReserveOutcome::FromAvailable);

        let (addr2, outcome2) = pool.reserve("cust-a", 20.0).await.unwrap();
        assert_eq!(outcome2, ReserveOutcome::Reused);
        assert_eq!(addr1, addr2);

        let stats = pool.stats().await;
        assert_eq!(stats.available, 1);
        assert_eq!(stats.reserved, 1);
    }

    #[tokio::test]
    async fn reserve_skips_available_entries_that_already_intersect_used() {
        let (pool, _chain) = make_pool_with_available(2, 0).await;

        // Simulate a stale Available entry for an address that is also Used
        // (e.g. a snapshot written between a late-payment recycle capture and
        // the Available queue being cleaned up).
        {
            let mut inner = pool.inner.lock().await;
            let stale_address = inner.available.front().unwrap().address.clone();
            let mut used_record = AddressRecord::new_available(stale_address.clone(), 0);
            used_record.mark_used("other-cust", 1.0);
            inner.used.insert(stale_address, used_record);
        }

        let (address, outcome) = pool.reserve("cust-a", 5.0).await.unwrap();
        assert_eq!(outcome, ReserveOutcome::FromAvailable);
        assert_ne!(address, pool.inner.lock().await.used.keys().next().unwrap().clone());

        let stats = pool.stats().await;
        assert_eq!(stats.available, 0);
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.used, 1);
    }

    #[tokio::test]
    async fn mark_used_transitions_and_is_idempotent_against_races() {
        let (pool, _chain) = make_pool_with_available(1, 0).await;
        let (address, _) = pool.reserve("cust-a", 5.0).await.unwrap();

        assert!(pool.mark_used(&address, "cust-a", 5.0).await);
        // A second caller racing for the same address loses.
        assert!(!pool.mark_used(&address, "cust-a", 5.0).await);

        let stats = pool.stats().await;
        assert_eq!(stats.used, 1);
        assert_eq!(stats.reserved, 0);
    }

    #[tokio::test]
    async fn release_returns_address_to_available() {
        let (pool, _chain) = make_pool_with_available(1, 0).await;
        let (address, _) = pool.reserve("cust-a", 5.0).await.unwrap();
        assert!(pool.release(&address).await);

        let stats = pool.stats().await;
        assert_eq!(stats.available, 1);
        assert_eq!(stats.reserved, 0);
    }

    #[tokio::test]
    async fn pool_exhausted_without_reachable_wallet_provider() {
        let (pool, _chain) = make_pool_with_available(0, 0).await;
        let result = pool.reserve("cust-a", 1.0).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn recycle_captures_late_payment_and_informs_gap_monitor() {
        let chain = test_chain(200_000);
        let gap_limit = test_gap_limit();
        let wallet = Arc::new(
            WalletProvider::new("http://127.0.0.1:0/", &crate::secret::Secret::new("x".to_owned()), Duration::from_secs(1))
                .unwrap(),
        );

        let mut record = AddressRecord::new_available("addr-0".to_owned(), 0);
        record.reserve("cust-a");
        record.reserved_at = Some(Utc::now() - chrono::Duration::hours(80));

        let mut snapshot = Snapshot::default();
        snapshot.reserved.insert(record.address.clone(), record);
        snapshot.next_index = 1;

        let pool = Arc::new(AddressPool::new(
            "site".to_owned(),
            PoolConfig::default(),
            snapshot,
            wallet,
            chain,
            gap_limit.clone(),
        ));

        let recycled = pool.recycle_expired().await;
        assert_eq!(recycled, 0, "a funded address is captured as Used, not recycled to Available");

        let stats = pool.stats().await;
        assert_eq!(stats.used, 1);
        assert_eq!(stats.reserved, 0);

        let (paid, _unpaid, _failures) = gap_limit.pressure_summary().await;
        assert_eq!(paid, 1, "late payment swept by recycle must be recorded in the gap monitor");
    }
}
