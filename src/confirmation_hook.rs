//! The external-notification seam described in `SPEC_FULL.md` §4.14. Real
//! deployments register a different implementation (Telegram, email, product
//! delivery) from outside the core; the core only guarantees the hook is
//! invoked at most once per confirmation and never rolls back state if it
//! fails or times out.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ConfirmationInfo {
    pub address: String,
    pub site: String,
    pub customer: String,
    pub sats: u64,
    pub btc: f64,
    pub usd: f64,
}

#[async_trait]
pub trait ConfirmationHook: Send + Sync {
    async fn on_confirmed(&self, info: ConfirmationInfo);
}

/// Default hook so the process is runnable standalone: logs the event and
/// does nothing else.
pub struct LoggingConfirmationHook;

#[async_trait]
impl ConfirmationHook for LoggingConfirmationHook {
    async fn on_confirmed(&self, info: ConfirmationInfo) {
        tracing::info!(
            address = info.address,
            site = info.site,
            customer = info.customer,
            sats = info.sats,
            usd = info.usd,
            "payment confirmed"
        );
    }
}

pub type SharedConfirmationHook = Arc<dyn ConfirmationHook>;

/// Invokes `hook` with a timeout; a failure or timeout is logged and
/// swallowed, never propagated.
pub async fn invoke_with_timeout(hook: &dyn ConfirmationHook, info: ConfirmationInfo, timeout: std::time::Duration) {
    let address = info.address.clone();
    if tokio::time::timeout(timeout, hook.on_confirmed(info)).await.is_err() {
        warn!(address, "confirmation hook timed out");
    }
}
