//! Replication Log
//!
//! The shared, append-only, totally ordered sequence of log entries for the
//! table, stored as sequential nodes under `/log`. Every replica copies new
//! entries into its own queue and advances its log pointer; entries are
//! immutable once published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::{sequence_of, CoordinationStore, CreateMode, TablePaths, TxnOp};
use crate::error::{Error, Result};
use crate::part::PartName;

/// What a log entry instructs replicas to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Obtain a part (fetch it unless already present)
    Get,
    /// Merge source parts into a new part
    MergeParts,
    /// Drop every part inside a range
    DropRange,
    /// Rewrite one part under a mutation version
    MutatePart,
    /// Drop a range and obtain replacement parts
    ReplaceRange,
    /// Attach an existing part published by another replica
    AttachPart,
    /// Apply a table metadata change
    AlterMetadata,
}

/// One replicated instruction. Immutable once published; execution may
/// resolve it to a covering part without mutating the persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: EntryKind,
    /// Replica that published the entry
    pub source_replica: String,
    pub create_time: DateTime<Utc>,
    /// Part this entry produces (absent for AlterMetadata)
    #[serde(default)]
    pub new_part_name: Option<PartName>,
    #[serde(default)]
    pub source_parts: Vec<PartName>,
    /// Content hash of the inserted block, for deduplication
    #[serde(default)]
    pub block_id: Option<String>,
    /// Confirmations required before the originating insert is acknowledged
    #[serde(default)]
    pub quorum: Option<usize>,
    /// Mutation this entry applies (MutatePart)
    #[serde(default)]
    pub mutation_version: Option<u64>,
    /// New table metadata (AlterMetadata)
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata_version: Option<u64>,
    /// Covering part the entry was resolved to at execution time.
    /// Never persisted.
    #[serde(skip)]
    pub actual_new_part_name: Option<PartName>,
}

impl LogEntry {
    fn base(kind: EntryKind, source_replica: impl Into<String>) -> Self {
        Self {
            kind,
            source_replica: source_replica.into(),
            create_time: Utc::now(),
            new_part_name: None,
            source_parts: Vec::new(),
            block_id: None,
            quorum: None,
            mutation_version: None,
            metadata: None,
            metadata_version: None,
            actual_new_part_name: None,
        }
    }

    pub fn get(
        source_replica: impl Into<String>,
        part: PartName,
        block_id: Option<String>,
        quorum: Option<usize>,
    ) -> Self {
        Self {
            new_part_name: Some(part),
            block_id,
            quorum,
            ..Self::base(EntryKind::Get, source_replica)
        }
    }

    pub fn merge_parts(
        source_replica: impl Into<String>,
        sources: Vec<PartName>,
        new_part: PartName,
    ) -> Self {
        Self {
            new_part_name: Some(new_part),
            source_parts: sources,
            ..Self::base(EntryKind::MergeParts, source_replica)
        }
    }

    pub fn drop_range(source_replica: impl Into<String>, range: PartName) -> Self {
        Self {
            new_part_name: Some(range),
            ..Self::base(EntryKind::DropRange, source_replica)
        }
    }

    pub fn mutate_part(
        source_replica: impl Into<String>,
        source: PartName,
        version: u64,
    ) -> Self {
        let new_part = source.mutated(version);
        Self {
            new_part_name: Some(new_part),
            source_parts: vec![source],
            mutation_version: Some(version),
            ..Self::base(EntryKind::MutatePart, source_replica)
        }
    }

    pub fn replace_range(
        source_replica: impl Into<String>,
        range: PartName,
        new_parts: Vec<PartName>,
    ) -> Self {
        Self {
            new_part_name: Some(range),
            source_parts: new_parts,
            ..Self::base(EntryKind::ReplaceRange, source_replica)
        }
    }

    pub fn attach_part(source_replica: impl Into<String>, part: PartName) -> Self {
        Self {
            new_part_name: Some(part),
            ..Self::base(EntryKind::AttachPart, source_replica)
        }
    }

    pub fn alter_metadata(
        source_replica: impl Into<String>,
        metadata: serde_json::Value,
        version: u64,
    ) -> Self {
        Self {
            metadata: Some(metadata),
            metadata_version: Some(version),
            ..Self::base(EntryKind::AlterMetadata, source_replica)
        }
    }

    /// The part this entry must make visible, if any
    pub fn target_part(&self) -> Option<&PartName> {
        self.new_part_name.as_ref()
    }

    /// The partition this entry works on, used for per-partition execution
    /// exclusivity
    pub fn partition_id(&self) -> Option<&str> {
        self.new_part_name.as_ref().map(|p| p.partition_id.as_str())
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self.target_part() {
            Some(part) => format!("{:?} {}", self.kind, part),
            None => format!("{:?}", self.kind),
        }
    }
}

/// The shared log plus this replica's pull state
pub struct ReplicationLog {
    paths: TablePaths,
}

impl ReplicationLog {
    pub fn new(paths: TablePaths) -> Self {
        Self { paths }
    }

    /// Append an entry to the shared log; returns the created node name
    pub async fn publish(
        &self,
        store: &dyn CoordinationStore,
        entry: &LogEntry,
    ) -> Result<String> {
        let path = store
            .create(
                &self.paths.log_entry_prefix(),
                &entry.serialize()?,
                CreateMode::PersistentSequential,
            )
            .await?;
        let node = path.rsplit('/').next().unwrap_or(&path).to_string();
        tracing::debug!(entry = %entry.describe(), node = %node, "published log entry");
        Ok(node)
    }

    /// The transaction op appending an entry, for composition into larger
    /// atomic publishes
    pub fn publish_op(&self, entry: &LogEntry) -> Result<TxnOp> {
        Ok(TxnOp::Create {
            path: self.paths.log_entry_prefix(),
            data: entry.serialize()?,
            mode: CreateMode::PersistentSequential,
        })
    }

    /// Highest log index, if the log is non-empty
    pub async fn max_index(&self, store: &dyn CoordinationStore) -> Result<Option<u64>> {
        let children = store.children(&self.paths.log_dir()).await?;
        Ok(children
            .iter()
            .filter_map(|name| sequence_of(name).ok())
            .max())
    }

    /// This replica's next-to-pull log index
    pub async fn pointer(&self, store: &dyn CoordinationStore, replica: &str) -> Result<u64> {
        let node = store.get(&self.paths.log_pointer(replica)).await?;
        match node {
            Some(node) => String::from_utf8_lossy(&node.data)
                .parse()
                .map_err(|_| Error::Coordination("malformed log pointer".into())),
            None => Ok(0),
        }
    }

    /// Copy log entries newer than the replica's pointer into its queue and
    /// advance the pointer, all in one atomic transaction. Returns how many
    /// entries were pulled.
    pub async fn pull_into_queue(
        &self,
        store: &dyn CoordinationStore,
        replica: &str,
    ) -> Result<usize> {
        let pointer_path = self.paths.log_pointer(replica);
        let pointer_node = store
            .get(&pointer_path)
            .await?
            .ok_or_else(|| Error::NodeNotFound(pointer_path.clone()))?;
        let pointer: u64 = String::from_utf8_lossy(&pointer_node.data)
            .parse()
            .map_err(|_| Error::Coordination("malformed log pointer".into()))?;

        let mut new_entries: Vec<(u64, String)> = store
            .children(&self.paths.log_dir())
            .await?
            .into_iter()
            .filter_map(|name| sequence_of(&name).ok().map(|seq| (seq, name)))
            .filter(|(seq, _)| *seq >= pointer)
            .collect();
        new_entries.sort();

        if new_entries.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(new_entries.len() + 1);
        for (_, name) in &new_entries {
            let node = store
                .get(&self.paths.log_entry(name))
                .await?
                .ok_or_else(|| Error::NodeNotFound(self.paths.log_entry(name)))?;
            ops.push(TxnOp::Create {
                path: self.paths.queue_entry_prefix(replica),
                data: node.data,
                mode: CreateMode::PersistentSequential,
            });
        }
        let next_pointer = new_entries.last().map(|(seq, _)| seq + 1).unwrap_or(pointer);
        ops.push(TxnOp::Set {
            path: pointer_path,
            data: next_pointer.to_string().into_bytes(),
            version: Some(pointer_node.version),
        });

        let pulled = new_entries.len();
        store.multi(ops).await?;
        tracing::debug!(replica, pulled, next_pointer, "pulled log entries into queue");
        Ok(pulled)
    }
}
