//! Short-TTL address -> satoshi memoization, so a burst of requests for the
//! same address within a few seconds doesn't hammer every balance provider.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct Entry {
    sats: u64,
    fetched_at: Instant,
}

pub struct BalanceCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl BalanceCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, address: &str) -> Option<u64> {
        let entries = self.entries.lock().await;
        let entry = entries.get(address)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.sats)
        } else {
            None
        }
    }

    pub async fn set(&self, address: &str, sats: u64) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            address.to_owned(),
            Entry {
                sats,
                fetched_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, address: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hit_within_ttl() {
        let cache = BalanceCache::new(Duration::from_secs(60));
        cache.set("addr", 42).await;
        assert_eq!(cache.get("addr").await, Some(42));
    }

    #[tokio::test]
    async fn miss_after_ttl_boundary() {
        let cache = BalanceCache::new(Duration::from_millis(10));
        cache.set("addr", 42).await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(cache.get("addr").await, None);
    }

    #[tokio::test]
    async fn miss_for_unknown_address() {
        let cache = BalanceCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("nope").await, None);
    }

    #[tokio::test]
    async fn invalidate_forces_miss() {
        let cache = BalanceCache::new(Duration::from_secs(60));
        cache.set("addr", 42).await;
        cache.invalidate("addr").await;
        assert_eq!(cache.get("addr").await, None);
    }
}
