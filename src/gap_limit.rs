//! Tracks pressure against the upstream wallet's gap limit and decides when
//! the rest of the system should switch into a more conservative posture.
//! See `SPEC_FULL.md` §4.7.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{register_gauge, Gauge};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, warn};

static UNPAID_RATIO: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("gap_limit_unpaid_ratio", "Unpaid / max-gap ratio.").unwrap());

static CONSECUTIVE_FAILURES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "gap_limit_consecutive_failures",
        "Consecutive gap-limit errors observed."
    )
    .unwrap()
});

const RING_CAPACITY: usize = 100;
const ALERT_COOLDOWN: Duration = Duration::from_secs(15 * 60);
const ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
pub struct GapLimitConfig {
    pub max_gap: u64,
    pub warn_ratio: f64,
    pub critical_ratio: f64,
}

impl Default for GapLimitConfig {
    fn default() -> Self {
        Self { max_gap: 20, warn_ratio: 0.70, critical_ratio: 0.85 }
    }
}

struct GapError {
    customer: String,
    message: String,
    at: Instant,
}

struct State {
    total_generated: u64,
    paid: u64,
    unpaid: u64,
    consecutive_failures: u32,
    last_error_at: Option<Instant>,
    ring: VecDeque<GapError>,
    last_alert_at: Option<Instant>,
}

pub struct GapLimitMonitor {
    config: RwLock<GapLimitConfig>,
    state: Mutex<State>,
}

impl GapLimitMonitor {
    #[must_use]
    pub fn new(config: GapLimitConfig) -> Self {
        Self {
            config: RwLock::new(config),
            state: Mutex::new(State {
                total_generated: 0,
                paid: 0,
                unpaid: 0,
                consecutive_failures: 0,
                last_error_at: None,
                ring: VecDeque::with_capacity(RING_CAPACITY),
                last_alert_at: None,
            }),
        }
    }

    fn config(&self) -> GapLimitConfig {
        *self.config.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub async fn on_address_generated(&self) {
        let config = self.config();
        let mut state = self.state.lock().await;
        state.total_generated += 1;
        state.unpaid += 1;
        state.consecutive_failures = 0;

        let ratio = state.unpaid as f64 / config.max_gap as f64;
        UNPAID_RATIO.set(ratio);

        let should_alert = state
            .last_alert_at
            .map(|t| t.elapsed() >= ALERT_COOLDOWN)
            .unwrap_or(true);

        if ratio >= config.critical_ratio && should_alert {
            error!(ratio, "gap limit critical: unpaid addresses approaching the limit");
            state.last_alert_at = Some(Instant::now());
        } else if ratio >= config.warn_ratio && should_alert {
            warn!(ratio, "gap limit warning: unpaid addresses rising");
            state.last_alert_at = Some(Instant::now());
        }
    }

    pub async fn on_payment(&self) {
        let max_gap = self.config().max_gap;
        let mut state = self.state.lock().await;
        state.paid += 1;
        state.unpaid = state.unpaid.saturating_sub(1);
        UNPAID_RATIO.set(state.unpaid as f64 / max_gap as f64);
    }

    pub async fn on_gap_error(&self, customer: &str, msg: &str) {
        let mut state = self.state.lock().await;

        if state.ring.len() == RING_CAPACITY {
            state.ring.pop_front();
        }
        state.ring.push_back(GapError {
            customer: customer.to_owned(),
            message: msg.to_owned(),
            at: Instant::now(),
        });

        state.consecutive_failures += 1;
        state.last_error_at = Some(Instant::now());
        CONSECUTIVE_FAILURES.set(f64::from(state.consecutive_failures));

        if state.consecutive_failures == 3 || state.consecutive_failures == 5 {
            warn!(
                consecutive_failures = state.consecutive_failures,
                customer, msg, "repeated gap-limit errors"
            );
        }
    }

    /// Whether the rest of the system should switch to a more conservative
    /// posture (shorter recycle windows, tighter thresholds). `unpaid` is the
    /// caller's own up-to-date count (available + reserved), used alongside
    /// the monitor's internally tracked counters.
    pub async fn should_use_fallback(&self, unpaid: u64) -> bool {
        let config = self.config();
        let state = self.state.lock().await;

        if state.consecutive_failures >= 3 {
            return true;
        }

        let recent_errors = state.ring.iter().filter(|e| e.at.elapsed() < ERROR_WINDOW).count();
        if recent_errors >= 5 {
            return true;
        }

        let ratio_threshold = if recent_errors > 3 { 0.70 } else { config.critical_ratio };
        let ratio = unpaid.max(state.unpaid) as f64 / config.max_gap as f64;
        ratio >= ratio_threshold
    }

    pub async fn reset_unpaid(&self, n: u64) {
        let mut state = self.state.lock().await;
        state.unpaid = n;
    }

    /// Admin knob: retunes the warn/critical unpaid-ratio thresholds used by
    /// `on_address_generated`'s alerting and `should_use_fallback`.
    pub fn update_thresholds(&self, warn: f64, critical: f64) {
        let mut config = self.config.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        config.warn_ratio = warn;
        config.critical_ratio = critical;
    }

    /// Admin knob: retunes the upstream wallet's gap-limit constant itself.
    pub fn update_max_gap_limit(&self, max_gap: u64) {
        let mut config = self.config.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        config.max_gap = max_gap;
    }

    /// Periodic drift correction: re-derive `unpaid` from the pool's own
    /// counters and zero the failure streak once pressure has subsided.
    pub async fn reconcile(&self, pool_generated: u64, pool_used: u64) {
        let max_gap = self.config().max_gap;
        let mut state = self.state.lock().await;

        if state.unpaid > 10 {
            state.unpaid = pool_generated.saturating_sub(pool_used);
        }

        if state.consecutive_failures > 0 && state.unpaid < max_gap / 2 {
            state.consecutive_failures = 0;
            CONSECUTIVE_FAILURES.set(0.0);
        }
    }

    pub async fn recent_errors(&self) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        state.ring.iter().map(|e| (e.customer.clone(), e.message.clone())).collect()
    }

    /// `(paid, unpaid, consecutive_failures)`, for the supervisor's hourly
    /// status line.
    pub async fn pressure_summary(&self) -> (u64, u64, u32) {
        let state = self.state.lock().await;
        (state.paid, state.unpaid, state.consecutive_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn three_consecutive_errors_trip_fallback() {
        let monitor = GapLimitMonitor::new(GapLimitConfig::default());
        for _ in 0..3 {
            monitor.on_gap_error("cust", "boom").await;
        }
        assert!(monitor.should_use_fallback(0).await);
    }

    #[tokio::test]
    async fn payment_reduces_unpaid() {
        let monitor = GapLimitMonitor::new(GapLimitConfig::default());
        monitor.on_address_generated().await;
        monitor.on_payment().await;
        assert!(!monitor.should_use_fallback(0).await);
    }

    #[tokio::test]
    async fn high_ratio_trips_fallback() {
        let monitor = GapLimitMonitor::new(GapLimitConfig { max_gap: 10, ..GapLimitConfig::default() });
        for _ in 0..9 {
            monitor.on_address_generated().await;
        }
        assert!(monitor.should_use_fallback(9).await);
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded() {
        let monitor = GapLimitMonitor::new(GapLimitConfig::default());
        for i in 0..150 {
            monitor.on_gap_error("cust", &format!("error {i}")).await;
        }
        assert_eq!(monitor.recent_errors().await.len(), RING_CAPACITY);
    }

    #[tokio::test]
    async fn update_thresholds_takes_effect_immediately() {
        let monitor = GapLimitMonitor::new(GapLimitConfig { max_gap: 10, ..GapLimitConfig::default() });
        for _ in 0..5 {
            monitor.on_address_generated().await;
        }
        assert!(!monitor.should_use_fallback(5).await);

        monitor.update_thresholds(0.1, 0.2);
        assert!(monitor.should_use_fallback(5).await);
    }

    #[tokio::test]
    async fn update_max_gap_limit_changes_the_ratio_denominator() {
        let monitor = GapLimitMonitor::new(GapLimitConfig { max_gap: 100, ..GapLimitConfig::default() });
        for _ in 0..9 {
            monitor.on_address_generated().await;
        }
        assert!(!monitor.should_use_fallback(9).await);

        monitor.update_max_gap_limit(10);
        assert!(monitor.should_use_fallback(9).await);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn critical_ratio_logs_an_alert() {
        let monitor = GapLimitMonitor::new(GapLimitConfig { max_gap: 10, ..GapLimitConfig::default() });
        for _ in 0..9 {
            monitor.on_address_generated().await;
        }
        assert!(logs_contain("gap limit critical"));
    }

    #[tokio::test]
    async fn reconcile_rederives_unpaid_and_clears_failure_streak() {
        let monitor = GapLimitMonitor::new(GapLimitConfig::default());
        monitor.on_gap_error("cust", "boom").await;
        monitor.on_gap_error("cust", "boom").await;
        for _ in 0..15 {
            monitor.on_address_generated().await;
        }

        monitor.reconcile(15, 14).await;
        let (_, unpaid, consecutive_failures) = monitor.pressure_summary().await;
        assert_eq!(unpaid, 1);
        assert_eq!(consecutive_failures, 0);
    }
}
