//! Per-address subscriber fanout for the duplex balance stream and the
//! one-way balance event stream. See `SPEC_FULL.md` §4.10.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

const EVENT_STREAM_BUFFER: usize = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEvent {
    pub address: String,
    pub status: &'static str,
    pub balance: u64,
    pub balance_btc: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub email: Option<String>,
}

impl BalanceEvent {
    #[must_use]
    pub fn waiting(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            status: "waiting",
            balance: 0,
            balance_btc: 0.0,
            timestamp: chrono::Utc::now(),
            email: None,
        }
    }

    #[must_use]
    pub fn confirmed(address: &str, sats: u64, email: Option<String>) -> Self {
        Self {
            address: address.to_owned(),
            status: "confirmed",
            balance: sats,
            balance_btc: sats as f64 / 100_000_000.0,
            timestamp: chrono::Utc::now(),
            email,
        }
    }
}

struct AddressSinks {
    duplex: HashMap<Uuid, mpsc::Sender<BalanceEvent>>,
    events: HashMap<Uuid, mpsc::Sender<BalanceEvent>>,
}

impl AddressSinks {
    fn is_empty(&self) -> bool {
        self.duplex.is_empty() && self.events.is_empty()
    }
}

/// Registry of active subscriptions, keyed by address. `Broadcast` delivers
/// to every live sink for an address; a send that fails (receiver dropped)
/// detaches that sink. Detach is idempotent and empty address entries are
/// removed so the map doesn't grow unbounded.
#[derive(Default)]
pub struct FanoutRegistry {
    by_address: Mutex<HashMap<String, AddressSinks>>,
}

pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<BalanceEvent>,
}

impl FanoutRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a duplex-stream subscriber and immediately queues a
    /// `waiting` event, matching the contract that a new subscription always
    /// sees `waiting` first.
    pub async fn subscribe_duplex(&self, address: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(EVENT_STREAM_BUFFER);
        let id = Uuid::new_v4();
        let _ = tx.send(BalanceEvent::waiting(address)).await;

        let mut by_address = self.by_address.lock().await;
        by_address
            .entry(address.to_owned())
            .or_insert_with(|| AddressSinks { duplex: HashMap::new(), events: HashMap::new() })
            .duplex
            .insert(id, tx);

        Subscription { id, receiver: rx }
    }

    /// Registers an event-stream (SSE) subscriber. Full buffers drop the
    /// event and log, rather than detaching the sink.
    pub async fn subscribe_events(&self, address: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(EVENT_STREAM_BUFFER);
        let id = Uuid::new_v4();
        let _ = tx.send(BalanceEvent::waiting(address)).await;

        let mut by_address = self.by_address.lock().await;
        by_address
            .entry(address.to_owned())
            .or_insert_with(|| AddressSinks { duplex: HashMap::new(), events: HashMap::new() })
            .events
            .insert(id, tx);

        Subscription { id, receiver: rx }
    }

    pub async fn unsubscribe(&self, address: &str, id: Uuid) {
        let mut by_address = self.by_address.lock().await;
        if let Some(sinks) = by_address.get_mut(address) {
            sinks.duplex.remove(&id);
            sinks.events.remove(&id);
            if sinks.is_empty() {
                by_address.remove(address);
            }
        }
    }

    /// Delivers `event` to every sink registered for `address`. A no-op if
    /// there are no subscribers.
    pub async fn broadcast(&self, address: &str, event: BalanceEvent) {
        let mut by_address = self.by_address.lock().await;
        let Some(sinks) = by_address.get_mut(address) else {
            return;
        };

        sinks.duplex.retain(|_, tx| tx.try_send(event.clone()).is_ok());

        for tx in sinks.events.values() {
            if tx.try_send(event.clone()).is_err() {
                debug!(address, "event stream buffer full, dropping event");
            }
        }
        sinks.events.retain(|_, tx| !tx.is_closed());

        if sinks.is_empty() {
            by_address.remove(address);
        }
    }

    #[must_use]
    pub async fn subscriber_count(&self, address: &str) -> usize {
        let by_address = self.by_address.lock().await;
        by_address.get(address).map(|s| s.duplex.len() + s.events.len()).unwrap_or(0)
    }

    /// Drops every sink registered for `address`. Dropping the sender side
    /// closes each subscriber's channel, which ends their websocket/SSE
    /// stream. Used by the lifecycle supervisor to retire subscriptions for
    /// addresses that confirmed long enough ago that every subscriber has
    /// already received the terminal event.
    pub async fn close_address(&self, address: &str) {
        self.by_address.lock().await.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_subscriber_sees_waiting_first() {
        let registry = FanoutRegistry::new();
        let mut sub = registry.subscribe_duplex("addr").await;
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.status, "waiting");
    }

    #[tokio::test]
    async fn broadcast_with_no_subscribers_is_noop() {
        let registry = FanoutRegistry::new();
        registry.broadcast("addr", BalanceEvent::confirmed("addr", 100, None)).await;
        assert_eq!(registry.subscriber_count("addr").await, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_both_sink_kinds() {
        let registry = FanoutRegistry::new();
        let mut duplex = registry.subscribe_duplex("addr").await;
        let mut events = registry.subscribe_events("addr").await;

        // Drain the initial `waiting` events.
        duplex.receiver.recv().await.unwrap();
        events.receiver.recv().await.unwrap();

        registry.broadcast("addr", BalanceEvent::confirmed("addr", 500, None)).await;

        assert_eq!(duplex.receiver.recv().await.unwrap().status, "confirmed");
        assert_eq!(events.receiver.recv().await.unwrap().status, "confirmed");
    }

    #[tokio::test]
    async fn unsubscribe_removes_empty_address_entry() {
        let registry = FanoutRegistry::new();
        let sub = registry.subscribe_duplex("addr").await;
        registry.unsubscribe("addr", sub.id).await;
        assert_eq!(registry.subscriber_count("addr").await, 0);
    }

    #[tokio::test]
    async fn close_address_ends_the_subscriber_stream() {
        let registry = FanoutRegistry::new();
        let mut sub = registry.subscribe_duplex("addr").await;
        sub.receiver.recv().await.unwrap(); // drain `waiting`

        registry.close_address("addr").await;
        assert_eq!(registry.subscriber_count("addr").await, 0);
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_detaches_on_next_broadcast() {
        let registry = FanoutRegistry::new();
        let sub = registry.subscribe_duplex("addr").await;
        drop(sub);

        registry.broadcast("addr", BalanceEvent::confirmed("addr", 1, None)).await;
        assert_eq!(registry.subscriber_count("addr").await, 0);
    }
}
