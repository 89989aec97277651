//! Merge & Mutation Selection
//!
//! Leader-side policy choosing which committed parts to combine or mutate.
//! Candidates come from the local store; the selector filters out anything
//! referenced by in-flight queue entries or threatened by an in-flight
//! insert, picks the biggest group under the size ceiling (ties go to the
//! oldest data), and publishes the entry through a guarded transaction that
//! re-checks the source parts and the log version.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::MergeConfig;
use crate::coordination::{sequence_of, CoordinationStore, TablePaths, TxnOp};
use crate::error::{Error, Result};
use crate::log::{LogEntry, ReplicationLog};
use crate::mutation::MutationEntry;
use crate::part::PartName;
use crate::queue::ReplicaQueue;
use crate::storage::{LocalStore, MergeCriteria, PartMeta};

/// Outcome of one selection attempt
#[derive(Debug)]
pub enum SelectOutcome {
    /// Entry published
    Selected { log_node: String, entry: LogEntry },
    /// A chosen source part vanished between selection and publish
    MissingPart(PartName),
    /// A conflicting log entry appeared concurrently
    LogUpdated,
    /// Nothing to do or a resource limit applied
    Postponed(String),
}

/// Leader-side merge/mutation selector
pub struct MergeSelector {
    paths: TablePaths,
    replica_name: String,
    config: MergeConfig,
    log: ReplicationLog,
    /// Serializes candidate composition; never held across store calls
    compose_mutex: Mutex<()>,
}

impl MergeSelector {
    pub fn new(paths: TablePaths, replica_name: impl Into<String>, config: MergeConfig) -> Self {
        Self {
            log: ReplicationLog::new(paths.clone()),
            paths,
            replica_name: replica_name.into(),
            config,
            compose_mutex: Mutex::new(()),
        }
    }

    fn criteria(&self) -> MergeCriteria {
        MergeCriteria {
            max_total_bytes: self.config.max_bytes_to_merge,
            max_parts: self.config.max_parts_per_merge,
            min_parts: self.config.min_parts_to_merge,
            retention: (self.config.retention_seconds > 0)
                .then(|| Duration::from_secs(self.config.retention_seconds)),
        }
    }

    /// Try to select and publish one merge
    pub async fn select_merge(
        &self,
        store: &dyn CoordinationStore,
        local: &dyn LocalStore,
        queue: &ReplicaQueue,
    ) -> Result<SelectOutcome> {
        // Gather phase: external reads, no lock held
        let candidates = local.select_merge_candidates(&self.criteria()).await?;
        if candidates.is_empty() {
            return Ok(SelectOutcome::Postponed("no merge candidates".into()));
        }
        let in_flight = queue.parts_in_flight().await;

        let partitions: HashSet<String> = candidates
            .iter()
            .filter_map(|g| g.first().map(|m| m.name.partition_id.clone()))
            .collect();
        let mut reserved_blocks: HashSet<(String, u64)> = HashSet::new();
        for partition in &partitions {
            let dir = self.paths.block_numbers_partition(partition);
            match store.children(&dir).await {
                Ok(children) => {
                    for child in children {
                        if let Ok(seq) = sequence_of(&child) {
                            reserved_blocks.insert((partition.clone(), seq));
                        }
                    }
                }
                Err(Error::NodeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let log_dir_version = store
            .get(&self.paths.log_dir())
            .await?
            .ok_or_else(|| Error::NodeNotFound(self.paths.log_dir()))?
            .version;

        // Compose phase: pure, under the selection mutex
        let chosen = {
            let _guard = self.compose_mutex.lock().await;
            choose_group(candidates, &in_flight, &reserved_blocks)
        };
        let Some(group) = chosen else {
            return Ok(SelectOutcome::Postponed("all candidates are busy".into()));
        };

        let sources: Vec<PartName> = group.iter().map(|m| m.name.clone()).collect();
        let new_part = PartName::merged(&sources)?;
        let entry = LogEntry::merge_parts(self.replica_name.clone(), sources.clone(), new_part);

        // Publish phase: the transaction re-checks what the compose phase
        // assumed
        let mut ops: Vec<TxnOp> = sources
            .iter()
            .map(|part| TxnOp::Check {
                path: self.paths.part(&self.replica_name, &part.to_string()),
                version: None,
            })
            .collect();
        ops.push(TxnOp::Check {
            path: self.paths.log_dir(),
            version: Some(log_dir_version),
        });
        ops.push(self.log.publish_op(&entry)?);

        match store.multi(ops).await {
            Ok(results) => {
                let log_node = created_node(&results);
                tracing::info!(
                    entry = %entry.describe(),
                    sources = sources.len(),
                    "merge selected"
                );
                Ok(SelectOutcome::Selected { log_node, entry })
            }
            Err(Error::TxnFailed { index, .. }) if index < sources.len() => {
                Ok(SelectOutcome::MissingPart(sources[index].clone()))
            }
            Err(Error::TxnFailed { .. }) => Ok(SelectOutcome::LogUpdated),
            Err(e) => Err(e),
        }
    }

    /// Try to schedule one MutatePart entry for the oldest unfinished
    /// mutation
    pub async fn select_mutation(
        &self,
        store: &dyn CoordinationStore,
        local: &dyn LocalStore,
        queue: &ReplicaQueue,
        mutations: &[MutationEntry],
    ) -> Result<SelectOutcome> {
        let parts = local.list_committed_parts().await?;
        let in_flight = queue.parts_in_flight().await;

        let chosen = {
            let _guard = self.compose_mutex.lock().await;
            choose_mutation_part(mutations, &parts, &in_flight)
        };
        let Some((mutation_version, source)) = chosen else {
            return Ok(SelectOutcome::Postponed("no parts need mutation".into()));
        };

        let entry = LogEntry::mutate_part(self.replica_name.clone(), source.clone(), mutation_version);
        let ops = vec![
            TxnOp::Check {
                path: self.paths.part(&self.replica_name, &source.to_string()),
                version: None,
            },
            self.log.publish_op(&entry)?,
        ];

        match store.multi(ops).await {
            Ok(results) => {
                let log_node = created_node(&results);
                tracing::info!(entry = %entry.describe(), "mutation scheduled");
                Ok(SelectOutcome::Selected { log_node, entry })
            }
            Err(Error::TxnFailed { index: 0, .. }) => Ok(SelectOutcome::MissingPart(source)),
            Err(Error::TxnFailed { .. }) => Ok(SelectOutcome::LogUpdated),
            Err(e) => Err(e),
        }
    }
}

fn created_node(results: &[crate::coordination::TxnResult]) -> String {
    results
        .iter()
        .find_map(|r| match r {
            crate::coordination::TxnResult::Created { path } => {
                Some(path.rsplit('/').next().unwrap_or(path).to_string())
            }
            _ => None,
        })
        .unwrap_or_default()
}

/// Pick the best candidate group: maximal combined size under the ceiling,
/// ties broken by oldest insertion
fn choose_group(
    candidates: Vec<Vec<PartMeta>>,
    in_flight: &HashSet<PartName>,
    reserved_blocks: &HashSet<(String, u64)>,
) -> Option<Vec<PartMeta>> {
    candidates
        .into_iter()
        .filter(|group| {
            group
                .iter()
                .all(|m| !in_flight.iter().any(|f| f.overlaps(&m.name)))
        })
        .filter(|group| !spans_reserved_gap(group, reserved_blocks))
        .max_by(|a, b| {
            let size_a: u64 = a.iter().map(|m| m.bytes).sum();
            let size_b: u64 = b.iter().map(|m| m.bytes).sum();
            size_a.cmp(&size_b).then_with(|| {
                let oldest_a = a.iter().map(|m| m.created).min();
                let oldest_b = b.iter().map(|m| m.created).min();
                // Older data wins the tie
                oldest_b.cmp(&oldest_a)
            })
        })
}

/// A reserved block number inside the group's span but outside every source
/// part means an in-flight insert could land between the sources; merging
/// across it would make that part unreachable.
fn spans_reserved_gap(group: &[PartMeta], reserved_blocks: &HashSet<(String, u64)>) -> bool {
    let Some(first) = group.first() else {
        return false;
    };
    let partition = &first.name.partition_id;
    let min = group.iter().map(|m| m.name.min_block).min().unwrap_or(0);
    let max = group.iter().map(|m| m.name.max_block).max().unwrap_or(0);

    reserved_blocks
        .iter()
        .filter(|(p, _)| p == partition)
        .any(|(_, block)| {
            *block > min
                && *block < max
                && !group.iter().any(|m| m.name.contains_block(*block))
        })
}

fn choose_mutation_part(
    mutations: &[MutationEntry],
    parts: &[PartMeta],
    in_flight: &HashSet<PartName>,
) -> Option<(u64, PartName)> {
    for mutation in mutations.iter().filter(|m| !m.done) {
        for part in parts {
            if !mutation.needs_part(&part.name) {
                continue;
            }
            let produced = part.name.mutated(mutation.version);
            let busy = in_flight
                .iter()
                .any(|f| f.overlaps(&part.name) || f.overlaps(&produced));
            if !busy {
                return Some((mutation.version, part.name.clone()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn meta(name: &str, bytes: u64) -> PartMeta {
        PartMeta {
            name: PartName::parse(name).unwrap(),
            bytes,
            rows: 1,
            created: Utc::now(),
        }
    }

    #[test]
    fn test_choose_group_prefers_biggest() {
        let candidates = vec![
            vec![meta("p_0_0_0", 10), meta("p_1_1_0", 10)],
            vec![meta("p_0_0_0", 10), meta("p_1_1_0", 10), meta("p_2_2_0", 30)],
        ];
        let chosen = choose_group(candidates, &HashSet::new(), &HashSet::new()).unwrap();
        assert_eq!(chosen.len(), 3);
    }

    #[test]
    fn test_choose_group_skips_in_flight_parts() {
        let candidates = vec![vec![meta("p_0_0_0", 10), meta("p_1_1_0", 10)]];
        let in_flight = HashSet::from([PartName::parse("p_1_1_0").unwrap()]);
        assert!(choose_group(candidates, &in_flight, &HashSet::new()).is_none());
    }

    #[test]
    fn test_choose_group_respects_reserved_gaps() {
        // Parts 0..0 and 2..2 with block 1 reserved by an in-flight insert
        let candidates = vec![vec![meta("p_0_0_0", 10), meta("p_2_2_0", 10)]];
        let reserved = HashSet::from([("p".to_string(), 1u64)]);
        assert!(choose_group(candidates.clone(), &HashSet::new(), &reserved).is_none());

        // A reserved block covered by a source part does not block
        let covered = HashSet::from([("p".to_string(), 2u64)]);
        assert!(choose_group(candidates, &HashSet::new(), &covered).is_some());
    }
}
