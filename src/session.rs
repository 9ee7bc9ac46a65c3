//! Minimal per-customer bookkeeping the core needs: which addresses a
//! customer has been issued, which have been paid, and a cap on concurrently
//! outstanding addresses that relaxes once a customer has a payment on
//! record. Everything else about the customer (profile, auth) lives outside
//! the core. See `SPEC_FULL.md` §4.11.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

const DEFAULT_OUTSTANDING_LIMIT: usize = 1;
const EXTENDED_OUTSTANDING_LIMIT: usize = 5;
const PAYMENT_HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone)]
pub struct PaymentInfo {
    pub price: f64,
    pub description: String,
    pub name: String,
    pub site: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct CustomerState {
    generated_addresses: HashMap<String, DateTime<Utc>>,
    used_addresses: std::collections::HashSet<String>,
    extended: bool,
    history: VecDeque<PaymentInfo>,
}

/// address <-> customer lookup plus the small amount of per-customer state
/// needed to decide whether a new address may be issued.
#[derive(Default)]
pub struct SessionIndex {
    customers: Mutex<HashMap<String, CustomerState>>,
    address_to_customer: Mutex<HashMap<String, String>>,
}

impl SessionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_generated(&self, customer: &str, address: &str) {
        let mut customers = self.customers.lock().await;
        customers
            .entry(customer.to_owned())
            .or_default()
            .generated_addresses
            .insert(address.to_owned(), Utc::now());

        let mut by_address = self.address_to_customer.lock().await;
        by_address.insert(address.to_owned(), customer.to_owned());
    }

    pub async fn record_used(&self, customer: &str, address: &str, payment: PaymentInfo) {
        let mut customers = self.customers.lock().await;
        let state = customers.entry(customer.to_owned()).or_default();
        state.used_addresses.insert(address.to_owned());
        state.extended = true;

        if state.history.len() == PAYMENT_HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(payment);
    }

    pub async fn customer_for(&self, address: &str) -> Option<String> {
        self.address_to_customer.lock().await.get(address).cloned()
    }

    /// Maximum number of concurrently outstanding (generated but unpaid)
    /// addresses this customer may hold. Extended once they have at least
    /// one payment on record.
    pub async fn outstanding_limit(&self, customer: &str) -> usize {
        let customers = self.customers.lock().await;
        match customers.get(customer) {
            Some(state) if state.extended => EXTENDED_OUTSTANDING_LIMIT,
            _ => DEFAULT_OUTSTANDING_LIMIT,
        }
    }

    pub async fn outstanding_count(&self, customer: &str) -> usize {
        let customers = self.customers.lock().await;
        customers
            .get(customer)
            .map(|s| s.generated_addresses.len() - s.used_addresses.len())
            .unwrap_or(0)
    }

    pub async fn recent_payments(&self, customer: &str) -> Vec<PaymentInfo> {
        let customers = self.customers.lock().await;
        customers.get(customer).map(|s| s.history.iter().cloned().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outstanding_limit_extends_after_payment() {
        let index = SessionIndex::new();
        assert_eq!(index.outstanding_limit("cust").await, DEFAULT_OUTSTANDING_LIMIT);

        index.record_generated("cust", "addr").await;
        index
            .record_used(
                "cust",
                "addr",
                PaymentInfo {
                    price: 10.0,
                    description: "widget".to_owned(),
                    name: "widget".to_owned(),
                    site: "site".to_owned(),
                    created_at: Utc::now(),
                },
            )
            .await;

        assert_eq!(index.outstanding_limit("cust").await, EXTENDED_OUTSTANDING_LIMIT);
    }

    #[tokio::test]
    async fn customer_lookup_round_trips() {
        let index = SessionIndex::new();
        index.record_generated("cust", "addr").await;
        assert_eq!(index.customer_for("addr").await.as_deref(), Some("cust"));
        assert_eq!(index.customer_for("unknown").await, None);
    }

    #[tokio::test]
    async fn outstanding_count_tracks_multiple_customers_independently() {
        use maplit::hashmap;

        let index = SessionIndex::new();
        let addresses_by_customer = hashmap! {
            "cust-a" => vec!["addr-a1", "addr-a2"],
            "cust-b" => vec!["addr-b1"],
        };

        for (customer, addresses) in &addresses_by_customer {
            for address in addresses {
                index.record_generated(customer, address).await;
            }
        }

        assert_eq!(index.outstanding_count("cust-a").await, 2);
        assert_eq!(index.outstanding_count("cust-b").await, 1);
        assert_eq!(index.outstanding_count("cust-c").await, 0);
    }
}
