//! Push-notification intake: HMAC-authenticated payloads that can confirm a
//! payment without waiting for the next poll tick. See `SPEC_FULL.md` §4.9.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::instrument;

use crate::confirmation_hook::{self, ConfirmationInfo, SharedConfirmationHook};
use crate::fanout::{BalanceEvent, FanoutRegistry};
use crate::gap_limit::GapLimitMonitor;
use crate::observer::CancelHandle;
use crate::pool::AddressPool;
use crate::rate_oracle::SharedRateOracle;
use crate::secret::Secret;
use crate::session::{PaymentInfo, SessionIndex};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
    #[error("invalid webhook signature")]
    BadSignature,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub status: i32,
    pub value: u64,
    pub txid: String,
    pub addr: String,
    #[serde(default)]
    pub confirmations: u32,
}

/// Verifies `signature_header` (`sha256=<hex>` or bare hex) against an
/// HMAC-SHA256 of `body` computed with `secret`, in constant time.
pub fn verify_signature(secret: &Secret<String>, body: &[u8], signature_header: &str) -> Result<(), Error> {
    let hex_sig = signature_header.strip_prefix("sha256=").unwrap_or(signature_header);
    let provided = hex::decode(hex_sig).map_err(|_| Error::BadSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.ct_eq(&provided).into() {
        Ok(())
    } else {
        Err(Error::BadSignature)
    }
}

pub fn parse_payload(body: &[u8]) -> Result<WebhookPayload, Error> {
    serde_json::from_slice(body).map_err(|e| Error::Malformed(e.to_string()))
}

/// What the caller (the HTTP handler) should report back to the client.
pub enum Outcome {
    /// `status < 1`: nothing to do yet, still waiting for more confirmations.
    Unconfirmed,
    /// The address is not tracked by this process.
    Untracked,
    /// This call won the race and performed the confirmation sequence.
    Confirmed,
    /// A racing observer or webhook call already confirmed this address.
    AlreadyConfirmed,
}

pub struct WebhookContext {
    pub pool: std::sync::Arc<AddressPool>,
    pub gap_limit: std::sync::Arc<GapLimitMonitor>,
    pub fanout: std::sync::Arc<FanoutRegistry>,
    pub sessions: std::sync::Arc<SessionIndex>,
    pub rate_oracle: SharedRateOracle,
    pub confirmation_hook: SharedConfirmationHook,
    pub notification_hook_timeout: std::time::Duration,
    pub site: String,
}

/// Processes an authenticated webhook payload: looks up the customer,
/// confirms the payment if this call wins the race against the observer,
/// and cancels `cancel` (if given) so the observer for the same address
/// stops polling.
#[instrument(level = "debug", skip(ctx, cancel))]
pub async fn handle(ctx: &WebhookContext, payload: &WebhookPayload, cancel: Option<&CancelHandle>) -> Outcome {
    if payload.status < 1 {
        return Outcome::Unconfirmed;
    }

    let Some(customer) = ctx.sessions.customer_for(&payload.addr).await else {
        return Outcome::Untracked;
    };

    let btc = payload.value as f64 / 100_000_000.0;
    let usd = match ctx.rate_oracle.btc_usd().await {
        Ok(rate) => btc * rate,
        Err(_) => 0.0,
    };

    if !ctx.pool.mark_used(&payload.addr, &customer, usd).await {
        return Outcome::AlreadyConfirmed;
    }

    if let Some(cancel) = cancel {
        cancel.cancel();
    }

    ctx.gap_limit.on_payment().await;

    ctx.sessions
        .record_used(
            &customer,
            &payload.addr,
            PaymentInfo {
                price: usd,
                description: String::new(),
                name: String::new(),
                site: ctx.site.clone(),
                created_at: chrono::Utc::now(),
            },
        )
        .await;

    ctx.fanout
        .broadcast(&payload.addr, BalanceEvent::confirmed(&payload.addr, payload.value, None))
        .await;

    confirmation_hook::invoke_with_timeout(
        ctx.confirmation_hook.as_ref(),
        ConfirmationInfo {
            address: payload.addr.clone(),
            site: ctx.site.clone(),
            customer,
            sats: payload.value,
            btc,
            usd,
        },
        ctx.notification_hook_timeout,
    )
    .await;

    Outcome::Confirmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let secret = Secret::new("shh".to_owned());
        let body = br#"{"status":1,"value":1,"txid":"t","addr":"a"}"#;

        let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        verify_signature(&secret, body, &format!("sha256={sig}")).unwrap();
        verify_signature(&secret, body, &sig).unwrap();
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let secret = Secret::new("shh".to_owned());
        let body = b"{}";
        let err = verify_signature(&secret, body, "sha256=deadbeef").unwrap_err();
        assert!(matches!(err, Error::BadSignature));
    }

    #[test]
    fn status_zero_parses_as_unconfirmed_payload() {
        let payload = parse_payload(br#"{"status":0,"value":0,"txid":"t","addr":"a"}"#).unwrap();
        assert_eq!(payload.status, 0);
    }

    #[test]
    fn malformed_body_is_rejected() {
        let err = parse_payload(b"not json").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }
}
