//! Local Store Boundary
//!
//! The single-node merge storage engine is an external collaborator. The
//! replication engine holds a `LocalStore` reference and never reaches past
//! this capability surface: enumerate committed parts, enumerate merge
//! candidates, read part content, write a temporary part, commit or remove a
//! part. `MemoryStore` is a small in-memory implementation for tests and
//! embedded use.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::part::{Block, ChecksumManifest, PartFiles, PartName};

/// Metadata of one committed part
#[derive(Debug, Clone)]
pub struct PartMeta {
    pub name: PartName,
    pub bytes: u64,
    pub rows: u64,
    pub created: DateTime<Utc>,
}

/// Constraints the store applies when enumerating merge candidates
#[derive(Debug, Clone)]
pub struct MergeCriteria {
    /// Combined size ceiling for one candidate group
    pub max_total_bytes: u64,
    /// Maximum parts per group
    pub max_parts: usize,
    /// Minimum parts per group
    pub min_parts: usize,
    /// Groups whose parts are all older than this may ignore level adjacency
    pub retention: Option<Duration>,
}

/// A temporary part: written but not yet visible. Exclusively owned by its
/// creator until committed; dropping it before commit discards the data.
#[derive(Debug)]
pub struct TempPart {
    pub files: PartFiles,
}

/// Narrow capability interface onto the local merge storage engine
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// All committed parts, sorted by name
    async fn list_committed_parts(&self) -> Result<Vec<PartMeta>>;

    /// Candidate groups of adjacent committed parts satisfying `criteria`.
    /// Groups keep insertion order (oldest block range first); policy-level
    /// filtering is the caller's concern.
    async fn select_merge_candidates(&self, criteria: &MergeCriteria) -> Result<Vec<Vec<PartMeta>>>;

    /// Read the rows of a committed part
    async fn read_block(&self, name: &PartName) -> Result<Block>;

    /// The files of a committed part, for serving to another replica
    async fn part_files(&self, name: &PartName) -> Result<PartFiles>;

    /// The checksum manifest persisted when the part was committed
    async fn part_checksums(&self, name: &PartName) -> Result<ChecksumManifest>;

    /// Write rows into a temporary part
    async fn write_temp_part(&self, block: &Block) -> Result<TempPart>;

    /// Adopt files received from another replica as a temporary part
    async fn write_temp_files(&self, files: PartFiles) -> Result<TempPart>;

    /// Atomically install a temporary part under `name`. Committed parts
    /// covered by `name` become outdated in the same step.
    async fn commit_part(&self, temp: TempPart, name: &PartName) -> Result<()>;

    /// Remove a committed or outdated part
    async fn remove_part(&self, name: &PartName) -> Result<()>;

    /// Whether a part with exactly this name is committed
    async fn contains(&self, name: &PartName) -> Result<bool>;

    /// A committed part covering `name`, if any (including `name` itself)
    async fn covering_part(&self, name: &PartName) -> Result<Option<PartName>>;

    /// Drop outdated parts older than `ttl`; returns what was removed
    async fn cleanup_outdated(&self, ttl: Duration) -> Result<Vec<PartName>>;
}

struct StoredPart {
    meta: PartMeta,
    files: PartFiles,
    /// Frozen at commit time; later tampering with the files is detectable
    checksums: ChecksumManifest,
}

#[derive(Default)]
struct MemoryStoreInner {
    committed: BTreeMap<String, StoredPart>,
    outdated: BTreeMap<String, (StoredPart, DateTime<Utc>)>,
}

/// In-memory part store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite one file of a committed part without updating anything
    /// else. Exists so tests can simulate a source replica serving corrupted
    /// bytes; never used by the engine.
    pub async fn tamper_part_file(&self, name: &PartName, file: &str, data: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let part = inner
            .committed
            .get_mut(&name.to_string())
            .ok_or_else(|| Error::PartNotFound(name.to_string()))?;
        part.files.files.insert(file.to_string(), data);
        Ok(())
    }
}

impl MemoryStoreInner {
    fn get_committed(&self, name: &PartName) -> Result<&StoredPart> {
        self.committed
            .get(&name.to_string())
            .ok_or_else(|| Error::PartNotFound(name.to_string()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn list_committed_parts(&self) -> Result<Vec<PartMeta>> {
        let inner = self.inner.read().await;
        Ok(inner.committed.values().map(|p| p.meta.clone()).collect())
    }

    async fn select_merge_candidates(&self, criteria: &MergeCriteria) -> Result<Vec<Vec<PartMeta>>> {
        let inner = self.inner.read().await;

        // Committed parts per partition in block order; BTreeMap iteration
        // is name order, which sorts min_block lexicographically, so re-sort
        let mut by_partition: BTreeMap<&str, Vec<&PartMeta>> = BTreeMap::new();
        for part in inner.committed.values() {
            by_partition
                .entry(part.meta.name.partition_id.as_str())
                .or_default()
                .push(&part.meta);
        }

        let now = Utc::now();
        let mut groups = Vec::new();
        for parts in by_partition.values_mut() {
            parts.sort_by_key(|m| m.name.min_block);

            // Every window of consecutive parts (no committed part in
            // between) with uniform level and mutation version is a
            // candidate; retention-expired windows may mix levels.
            for start in 0..parts.len() {
                let mut total = parts[start].bytes;
                for end in start + 1..parts.len() {
                    if parts[end].name.mutation != parts[start].name.mutation {
                        break;
                    }
                    total += parts[end].bytes;
                    let count = end - start + 1;
                    if count > criteria.max_parts || total > criteria.max_total_bytes {
                        break;
                    }
                    let window = &parts[start..=end];
                    let uniform_level = window.iter().all(|m| m.name.level == window[0].name.level);
                    let past_retention = criteria.retention.map_or(false, |r| {
                        window.iter().all(|m| {
                            now.signed_duration_since(m.created).num_seconds() >= r.as_secs() as i64
                        })
                    });
                    if count >= criteria.min_parts && (uniform_level || past_retention) {
                        groups.push(window.iter().map(|m| (*m).clone()).collect());
                    }
                }
            }
        }
        Ok(groups)
    }

    async fn read_block(&self, name: &PartName) -> Result<Block> {
        let inner = self.inner.read().await;
        inner.get_committed(name)?.files.to_block()
    }

    async fn part_files(&self, name: &PartName) -> Result<PartFiles> {
        let inner = self.inner.read().await;
        Ok(inner.get_committed(name)?.files.clone())
    }

    async fn part_checksums(&self, name: &PartName) -> Result<ChecksumManifest> {
        let inner = self.inner.read().await;
        Ok(inner.get_committed(name)?.checksums.clone())
    }

    async fn write_temp_part(&self, block: &Block) -> Result<TempPart> {
        Ok(TempPart {
            files: PartFiles::from_block(block)?,
        })
    }

    async fn write_temp_files(&self, files: PartFiles) -> Result<TempPart> {
        Ok(TempPart { files })
    }

    async fn commit_part(&self, temp: TempPart, name: &PartName) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = name.to_string();
        if inner.committed.contains_key(&key) {
            return Err(Error::Internal(format!("part {} already committed", name)));
        }

        let rows = temp
            .files
            .files
            .get("count.txt")
            .and_then(|b| String::from_utf8_lossy(b).parse().ok())
            .unwrap_or(0);
        let covered: Vec<String> = inner
            .committed
            .iter()
            .filter(|(_, p)| name.covers(&p.meta.name) && &p.meta.name != name)
            .map(|(k, _)| k.clone())
            .collect();

        let now = Utc::now();
        for key in covered {
            if let Some(part) = inner.committed.remove(&key) {
                inner.outdated.insert(key, (part, now));
            }
        }

        let checksums = temp.files.checksums();
        inner.committed.insert(
            key,
            StoredPart {
                meta: PartMeta {
                    name: name.clone(),
                    bytes: temp.files.total_bytes(),
                    rows,
                    created: now,
                },
                files: temp.files,
                checksums,
            },
        );
        Ok(())
    }

    async fn remove_part(&self, name: &PartName) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = name.to_string();
        if inner.committed.remove(&key).is_none() && inner.outdated.remove(&key).is_none() {
            return Err(Error::PartNotFound(key));
        }
        Ok(())
    }

    async fn contains(&self, name: &PartName) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.committed.contains_key(&name.to_string()))
    }

    async fn covering_part(&self, name: &PartName) -> Result<Option<PartName>> {
        let inner = self.inner.read().await;
        Ok(inner
            .committed
            .values()
            .map(|p| &p.meta.name)
            .filter(|c| c.covers(name))
            .max_by_key(|c| (c.max_block - c.min_block, c.level))
            .cloned())
    }

    async fn cleanup_outdated(&self, ttl: Duration) -> Result<Vec<PartName>> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let expired: Vec<String> = inner
            .outdated
            .iter()
            .filter(|(_, (_, at))| {
                now.signed_duration_since(*at).num_seconds() >= ttl.as_secs() as i64
            })
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = Vec::new();
        for key in expired {
            if let Some((part, _)) = inner.outdated.remove(&key) {
                removed.push(part.meta.name);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn commit_block(store: &MemoryStore, name: &str, rows: Vec<serde_json::Value>) {
        let name = PartName::parse(name).unwrap();
        let block = Block::new(name.partition_id.clone(), rows);
        let temp = store.write_temp_part(&block).await.unwrap();
        store.commit_part(temp, &name).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_and_read() {
        let store = MemoryStore::new();
        commit_block(&store, "p_0_0_0", vec![json!({"id": 1})]).await;

        let name = PartName::parse("p_0_0_0").unwrap();
        assert!(store.contains(&name).await.unwrap());
        let block = store.read_block(&name).await.unwrap();
        assert_eq!(block.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_outdates_covered_parts() {
        let store = MemoryStore::new();
        commit_block(&store, "p_0_0_0", vec![json!({"id": 1})]).await;
        commit_block(&store, "p_1_1_0", vec![json!({"id": 2})]).await;
        commit_block(&store, "p_0_1_1", vec![json!({"id": 1}), json!({"id": 2})]).await;

        let committed: Vec<String> = store
            .list_committed_parts()
            .await
            .unwrap()
            .iter()
            .map(|m| m.name.to_string())
            .collect();
        assert_eq!(committed, vec!["p_0_1_1"]);

        // Outdated parts are retired only after their TTL
        assert!(store
            .cleanup_outdated(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());
        let removed = store.cleanup_outdated(Duration::ZERO).await.unwrap();
        assert_eq!(removed.len(), 2);
    }

    #[tokio::test]
    async fn test_covering_part() {
        let store = MemoryStore::new();
        commit_block(&store, "p_0_5_1", vec![json!({"id": 1})]).await;

        let target = PartName::parse("p_2_3_0").unwrap();
        let covering = store.covering_part(&target).await.unwrap().unwrap();
        assert_eq!(covering.to_string(), "p_0_5_1");

        let miss = PartName::parse("p_6_7_0").unwrap();
        assert!(store.covering_part(&miss).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_candidates_respect_level_and_size() {
        let store = MemoryStore::new();
        commit_block(&store, "p_0_0_0", vec![json!({"id": 1})]).await;
        commit_block(&store, "p_1_1_0", vec![json!({"id": 2})]).await;
        commit_block(&store, "p_2_5_1", vec![json!({"id": 3})]).await;

        let criteria = MergeCriteria {
            max_total_bytes: u64::MAX,
            max_parts: 10,
            min_parts: 2,
            retention: None,
        };
        let groups = store.select_merge_candidates(&criteria).await.unwrap();
        // Only the two level-0 parts form a uniform-level adjacent group
        assert_eq!(groups.len(), 1);
        let names: Vec<String> = groups[0].iter().map(|m| m.name.to_string()).collect();
        assert_eq!(names, vec!["p_0_0_0", "p_1_1_0"]);
    }
}
