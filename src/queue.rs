//! Per-Replica Queue
//!
//! The local mirror of this replica's queue in the coordination store.
//! Entries are removed only on success or when subsumed by a later
//! DropRange. Execution may reorder: a postponed entry never blocks later
//! independent entries, but conflicting entries on the same block range
//! serialize. The postpone delay backs off exponentially up to a fixed
//! ceiling, so a stuck entry is always retried within a bounded interval.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::coordination::{CoordinationStore, TablePaths};
use crate::error::{Error, Result};
use crate::log::{EntryKind, LogEntry};
use crate::part::PartName;

/// Retry/backoff policy for failed entries
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub min_postpone: Duration,
    pub max_postpone: Duration,
    pub max_tries_before_warn: u32,
}

impl From<&crate::config::QueueConfig> for QueuePolicy {
    fn from(config: &crate::config::QueueConfig) -> Self {
        Self {
            min_postpone: Duration::from_millis(config.min_postpone_ms),
            max_postpone: Duration::from_millis(config.max_postpone_ms),
            max_tries_before_warn: config.max_tries_before_warn,
        }
    }
}

/// One queued entry with execution bookkeeping
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    /// Queue node name in the coordination store
    pub node: String,
    pub entry: LogEntry,
    pub in_progress: bool,
    pub num_tries: u32,
    pub last_error: Option<String>,
    pub postpone_until: Option<Instant>,
}

/// Queue summary for the operator surface
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntrySummary {
    pub node: String,
    pub kind: String,
    pub new_part_name: Option<String>,
    pub num_tries: u32,
    pub in_progress: bool,
    pub last_error: Option<String>,
}

/// The replica's queue mirror
pub struct ReplicaQueue {
    paths: TablePaths,
    replica_name: String,
    policy: QueuePolicy,
    entries: RwLock<BTreeMap<String, QueuedEntry>>,
    last_update: RwLock<Option<chrono::DateTime<Utc>>>,
}

impl ReplicaQueue {
    pub fn new(paths: TablePaths, replica_name: impl Into<String>, policy: QueuePolicy) -> Self {
        Self {
            paths,
            replica_name: replica_name.into(),
            policy,
            entries: RwLock::new(BTreeMap::new()),
            last_update: RwLock::new(None),
        }
    }

    /// Refresh the mirror from the coordination store. Known entries keep
    /// their execution bookkeeping; entries whose nodes vanished are
    /// dropped.
    pub async fn sync_from_store(&self, store: &dyn CoordinationStore) -> Result<usize> {
        let names = store.children(&self.paths.queue_dir(&self.replica_name)).await?;
        let mut loaded = Vec::with_capacity(names.len());
        for name in &names {
            let path = self.paths.queue_entry(&self.replica_name, name);
            if let Some(node) = store.get(&path).await? {
                loaded.push((name.clone(), LogEntry::deserialize(&node.data)?));
            }
        }

        let mut added = 0;
        {
            let mut entries = self.entries.write().await;
            let live: HashSet<&String> = names.iter().collect();
            entries.retain(|node, _| live.contains(node));

            for (node, entry) in loaded {
                entries.entry(node.clone()).or_insert_with(|| {
                    added += 1;
                    QueuedEntry {
                        node,
                        entry,
                        in_progress: false,
                        num_tries: 0,
                        last_error: None,
                        postpone_until: None,
                    }
                });
            }
        }

        // Entries covered by a queued DropRange will never be needed, and
        // their source parts may already be gone; drop them before anything
        // tries to execute them
        let ranges: Vec<(String, PartName)> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|e| e.entry.kind == EntryKind::DropRange)
                .filter_map(|e| e.entry.target_part().cloned().map(|p| (e.node.clone(), p)))
                .collect()
        };
        for (node, range) in ranges {
            self.drop_subsumed(store, &range, &node).await?;
        }

        *self.last_update.write().await = Some(Utc::now());
        Ok(added)
    }

    /// When the mirror was last refreshed from the store
    pub async fn last_update_time(&self) -> Option<chrono::DateTime<Utc>> {
        *self.last_update.read().await
    }

    /// Record the covering part an entry was resolved to at execution time.
    /// Execution-local bookkeeping; the persisted record stays untouched.
    pub async fn note_resolved(&self, node: &str, part: PartName) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(node) {
            entry.entry.actual_new_part_name = Some(part);
        }
    }

    /// Throw away the mirror and rebuild it from the store. Used after
    /// session loss: local state is never trusted to have survived.
    pub async fn rebuild(&self, store: &dyn CoordinationStore) -> Result<usize> {
        self.entries.write().await.clear();
        self.sync_from_store(store).await
    }

    /// Pick the next entry ready for execution and mark it in-progress.
    /// `busy_partitions` is the executor's per-partition exclusive set.
    pub async fn next_ready(&self, busy_partitions: &HashSet<String>) -> Option<QueuedEntry> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let candidates: Vec<String> = entries
            .values()
            .filter(|e| !e.in_progress)
            .filter(|e| e.postpone_until.map_or(true, |until| until <= now))
            .filter(|e| {
                e.entry
                    .partition_id()
                    .map_or(true, |p| !busy_partitions.contains(p))
            })
            .map(|e| e.node.clone())
            .collect();

        for node in candidates {
            let conflict = {
                let candidate = &entries[&node];
                entries
                    .values()
                    .filter(|other| other.node != node)
                    .filter(|other| other.in_progress || other.node < node)
                    .any(|other| conflicts(candidate, other))
            };
            if !conflict {
                let chosen = entries.get_mut(&node).expect("candidate still present");
                chosen.in_progress = true;
                return Some(chosen.clone());
            }
        }
        None
    }

    /// Entry succeeded: remove it from the store and the mirror
    pub async fn complete(&self, store: &dyn CoordinationStore, node: &str) -> Result<()> {
        let path = self.paths.queue_entry(&self.replica_name, node);
        match store.remove(&path, None).await {
            Ok(()) | Err(Error::NodeNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.entries.write().await.remove(node);
        Ok(())
    }

    /// Entry failed: keep it, back off, surface a warning past the retry
    /// threshold
    pub async fn fail(&self, node: &str, error: &Error) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(node) {
            entry.in_progress = false;
            entry.num_tries += 1;
            entry.last_error = Some(error.to_string());

            let exponent = entry.num_tries.saturating_sub(1).min(16);
            let delay = self
                .policy
                .min_postpone
                .saturating_mul(1u32 << exponent)
                .min(self.policy.max_postpone);
            entry.postpone_until = Some(Instant::now() + delay);

            if entry.num_tries >= self.policy.max_tries_before_warn {
                tracing::warn!(
                    entry = %entry.entry.describe(),
                    tries = entry.num_tries,
                    %error,
                    "queue entry keeps failing"
                );
            } else {
                tracing::debug!(
                    entry = %entry.entry.describe(),
                    tries = entry.num_tries,
                    %error,
                    "queue entry postponed"
                );
            }
        }
    }

    /// Remove entries whose target part falls inside a dropped range.
    /// `except` is the node executing the drop itself.
    pub async fn drop_subsumed(
        &self,
        store: &dyn CoordinationStore,
        range: &PartName,
        except: &str,
    ) -> Result<usize> {
        let subsumed: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|e| e.node != except && !e.in_progress)
                .filter(|e| e.entry.kind != EntryKind::DropRange)
                .filter(|e| e.entry.target_part().map_or(false, |p| range.covers(p)))
                .map(|e| e.node.clone())
                .collect()
        };

        for node in &subsumed {
            self.complete(store, node).await?;
            tracing::debug!(node = %node, range = %range, "queue entry subsumed by drop");
        }
        Ok(subsumed.len())
    }

    /// Parts that pending entries will produce; the merge selector must not
    /// touch them
    pub async fn future_parts(&self) -> HashSet<PartName> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter_map(|e| e.entry.target_part().cloned())
            .collect()
    }

    /// Parts referenced by pending entries, as sources or targets
    pub async fn parts_in_flight(&self) -> HashSet<PartName> {
        let entries = self.entries.read().await;
        let mut parts = HashSet::new();
        for e in entries.values() {
            parts.extend(e.entry.target_part().cloned());
            parts.extend(e.entry.source_parts.iter().cloned());
        }
        parts
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Replication delay: age of the oldest unexecuted entry, in seconds
    pub async fn absolute_delay(&self) -> u64 {
        let entries = self.entries.read().await;
        entries
            .values()
            .map(|e| {
                Utc::now()
                    .signed_duration_since(e.entry.create_time)
                    .num_seconds()
                    .max(0) as u64
            })
            .max()
            .unwrap_or(0)
    }

    pub async fn summaries(&self) -> Vec<QueueEntrySummary> {
        let entries = self.entries.read().await;
        entries
            .values()
            .map(|e| QueueEntrySummary {
                node: e.node.clone(),
                kind: format!("{:?}", e.entry.kind),
                new_part_name: e.entry.target_part().map(|p| p.to_string()),
                num_tries: e.num_tries,
                in_progress: e.in_progress,
                last_error: e.last_error.clone(),
            })
            .collect()
    }
}

/// Whether `candidate` must wait for `other`. Entries conflict when their
/// block ranges interact: overlapping targets, or `other` producing a part
/// the candidate consumes.
fn conflicts(candidate: &QueuedEntry, other: &QueuedEntry) -> bool {
    let candidate_target = candidate.entry.target_part();
    let other_target = other.entry.target_part();

    if let (Some(a), Some(b)) = (candidate_target, other_target) {
        if a.overlaps(b) {
            return true;
        }
    }
    if let Some(b) = other_target {
        if candidate.entry.source_parts.iter().any(|s| s.overlaps(b)) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CreateMode, MemoryCoordination};

    fn policy() -> QueuePolicy {
        QueuePolicy {
            min_postpone: Duration::from_millis(50),
            max_postpone: Duration::from_millis(400),
            max_tries_before_warn: 3,
        }
    }

    async fn push(
        store: &dyn CoordinationStore,
        paths: &TablePaths,
        entry: &LogEntry,
    ) -> String {
        let path = store
            .create(
                &paths.queue_entry_prefix("r1"),
                &entry.serialize().unwrap(),
                CreateMode::PersistentSequential,
            )
            .await
            .unwrap();
        path.rsplit('/').next().unwrap().to_string()
    }

    async fn queue_with(
        coord: &MemoryCoordination,
    ) -> (ReplicaQueue, std::sync::Arc<crate::coordination::memory::MemorySession>) {
        let session = coord.session();
        session.ensure("/t/replicas/r1/queue").await.unwrap();
        let queue = ReplicaQueue::new(TablePaths::new("/t"), "r1", policy());
        (queue, session)
    }

    #[tokio::test]
    async fn test_sync_and_next_ready_in_order() {
        let coord = MemoryCoordination::new();
        let (queue, session) = queue_with(&coord).await;
        let paths = TablePaths::new("/t");

        let e1 = LogEntry::get("r2", PartName::parse("p_0_0_0").unwrap(), None, None);
        let e2 = LogEntry::get("r2", PartName::parse("p_1_1_0").unwrap(), None, None);
        push(session.as_ref(), &paths, &e1).await;
        push(session.as_ref(), &paths, &e2).await;

        assert_eq!(queue.sync_from_store(session.as_ref()).await.unwrap(), 2);

        let busy = HashSet::new();
        let first = queue.next_ready(&busy).await.unwrap();
        assert_eq!(first.entry.target_part().unwrap().to_string(), "p_0_0_0");

        // Non-conflicting later entry runs while the first is in progress
        let second = queue.next_ready(&busy).await.unwrap();
        assert_eq!(second.entry.target_part().unwrap().to_string(), "p_1_1_0");
        assert!(queue.next_ready(&busy).await.is_none());
    }

    #[tokio::test]
    async fn test_conflicting_entries_serialize() {
        let coord = MemoryCoordination::new();
        let (queue, session) = queue_with(&coord).await;
        let paths = TablePaths::new("/t");

        let get = LogEntry::get("r2", PartName::parse("p_0_0_0").unwrap(), None, None);
        let merge = LogEntry::merge_parts(
            "r2",
            vec![
                PartName::parse("p_0_0_0").unwrap(),
                PartName::parse("p_1_1_0").unwrap(),
            ],
            PartName::parse("p_0_1_1").unwrap(),
        );
        push(session.as_ref(), &paths, &get).await;
        push(session.as_ref(), &paths, &merge).await;
        queue.sync_from_store(session.as_ref()).await.unwrap();

        let busy = HashSet::new();
        let first = queue.next_ready(&busy).await.unwrap();
        assert_eq!(first.entry.kind, EntryKind::Get);
        // The merge consumes the part the in-progress get produces
        assert!(queue.next_ready(&busy).await.is_none());

        queue.complete(session.as_ref(), &first.node).await.unwrap();
        let second = queue.next_ready(&busy).await.unwrap();
        assert_eq!(second.entry.kind, EntryKind::MergeParts);
    }

    #[tokio::test]
    async fn test_failed_entry_backs_off_but_not_forever() {
        let coord = MemoryCoordination::new();
        let (queue, session) = queue_with(&coord).await;
        let paths = TablePaths::new("/t");

        let entry = LogEntry::get("r2", PartName::parse("p_0_0_0").unwrap(), None, None);
        push(session.as_ref(), &paths, &entry).await;
        queue.sync_from_store(session.as_ref()).await.unwrap();

        let busy = HashSet::new();
        let taken = queue.next_ready(&busy).await.unwrap();
        queue
            .fail(&taken.node, &Error::NoSourceReplica("p_0_0_0".into()))
            .await;

        // Postponed: not immediately ready
        assert!(queue.next_ready(&busy).await.is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        // Back within the bounded postpone window
        assert!(queue.next_ready(&busy).await.is_some());
    }

    #[tokio::test]
    async fn test_drop_subsumes_covered_entries() {
        let coord = MemoryCoordination::new();
        let (queue, session) = queue_with(&coord).await;
        let paths = TablePaths::new("/t");

        let get = LogEntry::get("r2", PartName::parse("p_3_3_0").unwrap(), None, None);
        let unrelated = LogEntry::get("r2", PartName::parse("q_0_0_0").unwrap(), None, None);
        let drop = LogEntry::drop_range("r2", PartName::parse("p_0_9_999").unwrap());
        push(session.as_ref(), &paths, &get).await;
        push(session.as_ref(), &paths, &unrelated).await;
        let drop_node = push(session.as_ref(), &paths, &drop).await;
        queue.sync_from_store(session.as_ref()).await.unwrap();

        let dropped = queue
            .drop_subsumed(
                session.as_ref(),
                &PartName::parse("p_0_9_999").unwrap(),
                &drop_node,
            )
            .await
            .unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(queue.len().await, 2);
    }
}
