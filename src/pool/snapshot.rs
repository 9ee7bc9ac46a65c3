//! On-disk representation of a pool's state. The snapshot is a durability
//! aid, not a source of truth: an empty/missing file means an empty pool,
//! and every operation must be correct starting from that state.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::types::{AddressRecord, PoolStats};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub available: Vec<AddressRecord>,
    pub reserved: HashMap<String, AddressRecord>,
    pub used: HashMap<String, AddressRecord>,
    pub stats: PoolStats,
    pub next_index: u32,

    /// Unknown keys from a newer schema version are preserved verbatim and
    /// re-emitted on the next write, rather than being dropped.
    #[serde(flatten)]
    pub unknown_fields: serde_json::Map<String, serde_json::Value>,
}

impl Snapshot {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot = serde_json::from_slice(&bytes)?;
                info!(path = %path.display(), "loaded pool snapshot");
                Ok(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no pool snapshot found, starting empty");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        crate::utils::atomic_write(path, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let snapshot = Snapshot::load(&path).await.unwrap();
        assert!(snapshot.available.is_empty());
        assert!(snapshot.reserved.is_empty());
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");

        let mut snapshot = Snapshot::default();
        snapshot
            .available
            .push(AddressRecord::new_available("addr-1".to_owned(), 1));
        snapshot.next_index = 2;

        snapshot.save(&path).await.unwrap();
        let loaded = Snapshot::load(&path).await.unwrap();

        assert_eq!(loaded.available.len(), 1);
        assert_eq!(loaded.available[0].address, "addr-1");
        assert_eq!(loaded.next_index, 2);
    }

    #[tokio::test]
    async fn stats_survive_a_save_reload_round_trip_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");

        let mut snapshot = Snapshot::default();
        snapshot.stats = PoolStats {
            available: 3,
            reserved: 1,
            used: 4,
            total_generated: 8,
            recycled: 2,
            gap_errors: 0,
            last_error: None,
        };

        snapshot.save(&path).await.unwrap();
        let reloaded = Snapshot::load(&path).await.unwrap();

        similar_asserts::assert_eq!(
            serde_json::to_string_pretty(&snapshot.stats).unwrap(),
            serde_json::to_string_pretty(&reloaded.stats).unwrap(),
        );
    }

    #[tokio::test]
    async fn unknown_top_level_keys_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        tokio::fs::write(
            &path,
            serde_json::json!({
                "available": [],
                "reserved": {},
                "used": {},
                "stats": {},
                "next_index": 0,
                "schema_version": 3
            })
            .to_string(),
        )
        .await
        .unwrap();

        let snapshot = Snapshot::load(&path).await.unwrap();
        assert_eq!(
            snapshot.unknown_fields.get("schema_version"),
            Some(&serde_json::json!(3))
        );

        snapshot.save(&path).await.unwrap();
        let reloaded = Snapshot::load(&path).await.unwrap();
        assert_eq!(
            reloaded.unknown_fields.get("schema_version"),
            Some(&serde_json::json!(3))
        );
    }
}
