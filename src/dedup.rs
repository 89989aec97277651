//! Deduplication Ledger
//!
//! Bounded per-partition record of recently inserted block content hashes,
//! kept under `/blocks/<partition>/<hash>`. A hash node is created in the
//! same atomic transaction that publishes the part, so a concurrent
//! duplicate insert loses the transaction and resolves to a no-op success.
//! Records expire on count and age windows; expiry may re-admit an old
//! block, which is the accepted trade-off for boundedness.

use std::time::Duration;

use chrono::Utc;

use crate::coordination::{CoordinationStore, CreateMode, TablePaths, TxnOp};
use crate::error::Result;
use crate::part::Block;

/// Deduplication window configuration
#[derive(Debug, Clone)]
pub struct DedupWindow {
    /// Hashes kept per partition; 0 disables deduplication
    pub window: usize,
    pub max_age: Duration,
}

impl From<&crate::config::DedupConfig> for DedupWindow {
    fn from(config: &crate::config::DedupConfig) -> Self {
        Self {
            window: config.window,
            max_age: Duration::from_secs(config.max_age_secs),
        }
    }
}

/// The dedup ledger of one table
pub struct DedupLedger {
    paths: TablePaths,
    window: DedupWindow,
}

impl DedupLedger {
    pub fn new(paths: TablePaths, window: DedupWindow) -> Self {
        Self { paths, window }
    }

    pub fn enabled(&self) -> bool {
        self.window.window > 0
    }

    /// Content identity of a block
    pub fn block_id(block: &Block) -> String {
        block.content_hash()
    }

    /// Look up a hash; returns the part name the duplicate block landed in
    pub async fn lookup(
        &self,
        store: &dyn CoordinationStore,
        partition: &str,
        hash: &str,
    ) -> Result<Option<String>> {
        let node = store.get(&self.paths.block(partition, hash)).await?;
        Ok(node.map(|n| String::from_utf8_lossy(&n.data).into_owned()))
    }

    /// Transaction op registering a hash, composed into the insert's atomic
    /// publish. The op fails if the hash already exists, which is how a
    /// concurrent duplicate is detected.
    pub fn register_op(&self, partition: &str, hash: &str, part_name: &str) -> TxnOp {
        TxnOp::Create {
            path: self.paths.block(partition, hash),
            data: part_name.as_bytes().to_vec(),
            mode: CreateMode::Persistent,
        }
    }

    /// Expire records beyond the count window or older than the age window.
    /// Returns how many were removed. Within the guaranteed window this
    /// never removes a record early.
    pub async fn trim(&self, store: &dyn CoordinationStore) -> Result<usize> {
        if !self.enabled() {
            return Ok(0);
        }
        let partitions = match store.children(&self.paths.blocks_dir()).await {
            Ok(partitions) => partitions,
            Err(crate::Error::NodeNotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let mut removed = 0;
        for partition in partitions {
            let dir = self.paths.blocks_partition(&partition);
            let hashes = store.children(&dir).await?;

            // Creation time decides both windows
            let mut records = Vec::with_capacity(hashes.len());
            for hash in hashes {
                if let Some(node) = store.get(&format!("{}/{}", dir, hash)).await? {
                    records.push((node.created, hash));
                }
            }
            records.sort();

            let over_count = records.len().saturating_sub(self.window.window);
            for (index, (created, hash)) in records.iter().enumerate() {
                let too_old = now.signed_duration_since(*created).num_seconds()
                    >= self.window.max_age.as_secs() as i64;
                if index < over_count || too_old {
                    match store.remove(&format!("{}/{}", dir, hash), None).await {
                        Ok(()) | Err(crate::Error::NodeNotFound(_)) => removed += 1,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;
    use serde_json::json;

    fn ledger(window: usize) -> DedupLedger {
        DedupLedger::new(
            TablePaths::new("/t"),
            DedupWindow {
                window,
                max_age: Duration::from_secs(3600),
            },
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let coord = MemoryCoordination::new();
        let session = coord.session();
        session.ensure("/t/blocks/p").await.unwrap();
        let ledger = ledger(10);

        let block = Block::new("p", vec![json!({"id": 1})]);
        let hash = DedupLedger::block_id(&block);
        assert!(ledger.lookup(session.as_ref(), "p", &hash).await.unwrap().is_none());

        session
            .multi(vec![ledger.register_op("p", &hash, "p_0_0_0")])
            .await
            .unwrap();
        assert_eq!(
            ledger.lookup(session.as_ref(), "p", &hash).await.unwrap().as_deref(),
            Some("p_0_0_0")
        );

        // Registering the same hash again loses the transaction
        assert!(session
            .multi(vec![ledger.register_op("p", &hash, "p_1_1_0")])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_trim_keeps_newest_window() {
        let coord = MemoryCoordination::new();
        let session = coord.session();
        session.ensure("/t/blocks/p").await.unwrap();
        let ledger = ledger(2);

        for i in 0..5 {
            session
                .multi(vec![ledger.register_op("p", &format!("hash{}", i), "part")])
                .await
                .unwrap();
        }

        let removed = ledger.trim(session.as_ref()).await.unwrap();
        assert_eq!(removed, 3);
        let left = session.children("/t/blocks/p").await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&"hash3".to_string()) && left.contains(&"hash4".to_string()));
    }
}
