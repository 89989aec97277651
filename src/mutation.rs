//! Mutations
//!
//! A mutation rewrites existing parts under a new mutation version. Entries
//! live under `/mutations/mutation-<seq>`; the sequence number is the
//! mutation version. At submit time a block number is allocated in every
//! known partition, freezing the set of parts the mutation applies to:
//! parts inserted later fall outside it. The leader schedules MutatePart
//! log entries; the finalization task marks the mutation done once no
//! committed part still needs it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::{sequence_of, CoordinationStore, CreateMode, TablePaths};
use crate::error::{Error, Result};
use crate::part::{Block, PartName};
use crate::storage::PartMeta;

/// One mutation command, applied row-by-row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationCommand {
    /// Drop rows whose `column` equals `value`
    Delete {
        column: String,
        value: serde_json::Value,
    },
    /// Set `column` to `value` on rows whose `where_column` equals
    /// `where_value`
    Update {
        column: String,
        value: serde_json::Value,
        where_column: String,
        where_value: serde_json::Value,
    },
}

/// Apply mutation commands to a block, producing the rewritten block
pub fn apply_commands(commands: &[MutationCommand], block: Block) -> Block {
    let mut rows = block.rows;
    for command in commands {
        match command {
            MutationCommand::Delete { column, value } => {
                rows.retain(|row| row.get(column) != Some(value));
            }
            MutationCommand::Update {
                column,
                value,
                where_column,
                where_value,
            } => {
                for row in &mut rows {
                    if row.get(where_column) == Some(where_value) {
                        if let Some(obj) = row.as_object_mut() {
                            obj.insert(column.clone(), value.clone());
                        }
                    }
                }
            }
        }
    }
    Block {
        partition_id: block.partition_id,
        rows,
    }
}

/// Progress of a mutation across the part set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationState {
    Submitted,
    PartiallyApplied,
    Done,
}

/// One submitted mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEntry {
    /// Node name under `/mutations`; derived from the store, not persisted
    #[serde(skip)]
    pub id: String,
    /// Mutation version (the node's sequence number)
    #[serde(skip)]
    pub version: u64,
    pub source_replica: String,
    pub create_time: DateTime<Utc>,
    pub commands: Vec<MutationCommand>,
    /// Block number frozen per partition at submit time
    pub block_numbers: BTreeMap<String, u64>,
    pub done: bool,
}

impl MutationEntry {
    /// Whether a committed part still has to be rewritten by this mutation
    pub fn needs_part(&self, part: &PartName) -> bool {
        if self.done {
            return false;
        }
        let Some(&frozen) = self.block_numbers.get(&part.partition_id) else {
            // Partition appeared after the mutation was submitted
            return false;
        };
        part.max_block < frozen && part.mutation.map_or(true, |m| m < self.version)
    }

    /// Progress against a committed part set
    pub fn state(&self, parts: &[PartMeta]) -> MutationState {
        if self.done || !parts.iter().any(|m| self.needs_part(&m.name)) {
            return MutationState::Done;
        }
        if parts.iter().any(|m| m.name.mutation == Some(self.version)) {
            return MutationState::PartiallyApplied;
        }
        MutationState::Submitted
    }
}

/// The table's mutation registry
pub struct MutationLog {
    paths: TablePaths,
}

impl MutationLog {
    pub fn new(paths: TablePaths) -> Self {
        Self { paths }
    }

    /// Submit a mutation. `partition_block_numbers` must hold a freshly
    /// allocated block number for every currently known partition.
    pub async fn submit(
        &self,
        store: &dyn CoordinationStore,
        source_replica: &str,
        commands: Vec<MutationCommand>,
        partition_block_numbers: BTreeMap<String, u64>,
    ) -> Result<MutationEntry> {
        let mut entry = MutationEntry {
            id: String::new(),
            version: 0,
            source_replica: source_replica.to_string(),
            create_time: Utc::now(),
            commands,
            block_numbers: partition_block_numbers,
            done: false,
        };
        let path = store
            .create(
                &self.paths.mutation_prefix(),
                &serde_json::to_vec(&entry)?,
                CreateMode::PersistentSequential,
            )
            .await?;
        entry.id = path.rsplit('/').next().unwrap_or(&path).to_string();
        entry.version = sequence_of(&entry.id)?;
        tracing::info!(mutation = %entry.id, version = entry.version, "mutation submitted");
        Ok(entry)
    }

    /// All mutations, oldest first
    pub async fn load_all(&self, store: &dyn CoordinationStore) -> Result<Vec<MutationEntry>> {
        let mut names = store.children(&self.paths.mutations_dir()).await?;
        names.sort();
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let path = self.paths.mutation(&name);
            if let Some(node) = store.get(&path).await? {
                let mut entry: MutationEntry = serde_json::from_slice(&node.data)?;
                entry.id = name.clone();
                entry.version = sequence_of(&name)?;
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn load(&self, store: &dyn CoordinationStore, id: &str) -> Result<MutationEntry> {
        let node = store
            .get(&self.paths.mutation(id))
            .await?
            .ok_or_else(|| Error::MutationNotFound(id.to_string()))?;
        let mut entry: MutationEntry = serde_json::from_slice(&node.data)?;
        entry.id = id.to_string();
        entry.version = sequence_of(id)?;
        Ok(entry)
    }

    /// Persist the done flag
    pub async fn mark_done(&self, store: &dyn CoordinationStore, entry: &MutationEntry) -> Result<()> {
        let mut done = entry.clone();
        done.done = true;
        store
            .set(&self.paths.mutation(&entry.id), &serde_json::to_vec(&done)?, None)
            .await?;
        tracing::info!(mutation = %entry.id, "mutation finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_delete_and_update() {
        let block = Block::new(
            "p",
            vec![
                json!({"id": 1, "status": "old"}),
                json!({"id": 2, "status": "old"}),
                json!({"id": 3, "status": "keep"}),
            ],
        );
        let commands = vec![
            MutationCommand::Delete {
                column: "id".into(),
                value: json!(1),
            },
            MutationCommand::Update {
                column: "status".into(),
                value: json!("new"),
                where_column: "id".into(),
                where_value: json!(2),
            },
        ];
        let mutated = apply_commands(&commands, block);
        assert_eq!(
            mutated.rows,
            vec![
                json!({"id": 2, "status": "new"}),
                json!({"id": 3, "status": "keep"}),
            ]
        );
    }

    #[test]
    fn test_needs_part_respects_frozen_block_numbers() {
        let entry = MutationEntry {
            id: "mutation-0000000005".into(),
            version: 5,
            source_replica: "r1".into(),
            create_time: Utc::now(),
            commands: vec![],
            block_numbers: BTreeMap::from([("p".to_string(), 10)]),
            done: false,
        };

        // Old part in a frozen partition: needs the mutation
        assert!(entry.needs_part(&PartName::parse("p_0_3_1").unwrap()));
        // Already mutated to this version
        assert!(!entry.needs_part(&PartName::parse("p_0_3_1_5").unwrap()));
        // Inserted after the freeze point
        assert!(!entry.needs_part(&PartName::parse("p_10_10_0").unwrap()));
        // Partition unknown at submit time
        assert!(!entry.needs_part(&PartName::parse("q_0_0_0").unwrap()));
    }
}
