//! One polling task per Reserved address, racing a push-driven cancellation
//! signal (the webhook path) against its own ticker until it observes a
//! balance, hits its deadline, or is told to stop. See `SPEC_FULL.md` §4.8.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{register_gauge, Gauge};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{info, instrument, warn};

use crate::chain::ChainReader;
use crate::confirmation_hook::{self, ConfirmationInfo, SharedConfirmationHook};
use crate::fanout::{BalanceEvent, FanoutRegistry};
use crate::gap_limit::GapLimitMonitor;
use crate::pool::AddressPool;
use crate::rate_oracle::SharedRateOracle;
use crate::session::{PaymentInfo, SessionIndex};
use crate::shutdown::Shutdown;

static ACTIVE_OBSERVERS: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("payment_observers_active", "Currently running payment observer tasks.").unwrap());

static OBSERVER_SLOT_EXHAUSTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "payment_observer_slots_exhausted_total",
        "Reservations for which no observer slot was available."
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy)]
pub struct ObserverConfig {
    pub fast_tick: Duration,
    pub slow_tick: Duration,
    pub deadline: Duration,
    pub max_concurrent: usize,
    pub notification_hook_timeout: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            fast_tick: Duration::from_secs(15),
            slow_tick: Duration::from_secs(60),
            deadline: Duration::from_secs(30 * 60),
            max_concurrent: 500,
            notification_hook_timeout: Duration::from_secs(5),
        }
    }
}

/// A handle used by the webhook path to cancel an in-flight observer once it
/// has won the race to confirm the same address.
#[derive(Clone)]
pub struct CancelHandle(Arc<Notify>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.notify_waiters();
    }
}

/// Shared collaborators an observer needs; grouped so `spawn` doesn't take a
/// dozen positional arguments.
pub struct ObserverContext {
    pub chain: Arc<ChainReader>,
    pub pool: Arc<AddressPool>,
    pub gap_limit: Arc<GapLimitMonitor>,
    pub fanout: Arc<FanoutRegistry>,
    pub sessions: Arc<SessionIndex>,
    pub rate_oracle: SharedRateOracle,
    pub confirmation_hook: SharedConfirmationHook,
    pub slots: Arc<Semaphore>,
    pub config: ObserverConfig,
}

/// Attempts to start an observer for `address`. Returns `None` (and bumps a
/// metric) if the global concurrency cap is exhausted; the reservation is
/// still valid, it just won't be polled in-process until the supervisor's
/// audit sweep notices it or a slot frees up.
pub fn try_spawn(
    ctx: Arc<ObserverContext>,
    shutdown: Shutdown,
    site: String,
    address: String,
    customer: String,
    fast: bool,
) -> Option<CancelHandle> {
    let permit = ctx.slots.clone().try_acquire_owned().ok();
    let Some(permit) = permit else {
        OBSERVER_SLOT_EXHAUSTED.inc();
        warn!(address, "no observer slot available, relying on audit sweep");
        return None;
    };

    let cancel = Arc::new(Notify::new());
    let handle = CancelHandle(cancel.clone());

    tokio::spawn(run(ctx, shutdown, site, address, customer, fast, cancel, permit));

    Some(handle)
}

#[instrument(level = "debug", skip(ctx, shutdown, cancel, _permit))]
#[allow(clippy::too_many_arguments)]
async fn run(
    ctx: Arc<ObserverContext>,
    shutdown: Shutdown,
    site: String,
    address: String,
    customer: String,
    fast: bool,
    cancel: Arc<Notify>,
    _permit: OwnedSemaphorePermit,
) {
    ACTIVE_OBSERVERS.inc();
    let _guard = scopeguard(|| ACTIVE_OBSERVERS.dec());

    let tick = if fast { ctx.config.fast_tick } else { ctx.config.slow_tick };
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    ctx.fanout.broadcast(&address, BalanceEvent::waiting(&address)).await;

    let deadline = tokio::time::sleep(ctx.config.deadline);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = cancel.notified() => {
                info!(address, "observer cancelled, confirmation handled elsewhere");
                return;
            }
            () = shutdown.await_shutdown_begin() => {
                info!(address, "observer stopping for shutdown");
                return;
            }
            () = &mut deadline => {
                info!(address, "observer reached its deadline without a payment");
                return;
            }
            _ = interval.tick() => {
                match ctx.chain.balance(&address).await {
                    Ok(sats) if sats > 0 => {
                        confirm(&ctx, &site, &address, &customer, sats).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(address, error = %e, "observer balance check failed, will retry"),
                }
            }
        }
    }
}

async fn confirm(ctx: &ObserverContext, site: &str, address: &str, customer: &str, sats: u64) {
    let btc = sats as f64 / 100_000_000.0;
    let usd = match ctx.rate_oracle.btc_usd().await {
        Ok(rate) => btc * rate,
        Err(e) => {
            warn!(address, error = %e, "rate oracle unavailable, reporting zero usd amount");
            0.0
        }
    };

    if !ctx.pool.mark_used(address, customer, usd).await {
        // Lost the race: the webhook path already confirmed this address.
        return;
    }

    ctx.gap_limit.on_payment().await;

    ctx.sessions
        .record_used(
            customer,
            address,
            PaymentInfo {
                price: usd,
                description: String::new(),
                name: String::new(),
                site: site.to_owned(),
                created_at: chrono::Utc::now(),
            },
        )
        .await;

    ctx.fanout
        .broadcast(address, BalanceEvent::confirmed(address, sats, None))
        .await;

    confirmation_hook::invoke_with_timeout(
        ctx.confirmation_hook.as_ref(),
        ConfirmationInfo {
            address: address.to_owned(),
            site: site.to_owned(),
            customer: customer.to_owned(),
            sats,
            btc,
            usd,
        },
        ctx.config.notification_hook_timeout,
    )
    .await;
}

fn scopeguard<F: FnOnce()>(f: F) -> impl Drop {
    struct Guard<F: FnOnce()>(Option<F>);
    impl<F: FnOnce()> Drop for Guard<F> {
        fn drop(&mut self) {
            if let Some(f) = self.0.take() {
                f();
            }
        }
    }
    Guard(Some(f))
}
