//! Quorum Write Coordinator
//!
//! Tracks durable-confirmation count for an in-flight insert. The status
//! node is created atomically with the insert's log entry; every replica
//! that durably installs the part adds itself through a version-checked
//! transaction. The issuing insert blocks, with a timeout, until the
//! threshold is met or failure is declared; background tasks never block on
//! a quorum.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::coordination::{CoordinationStore, CreateMode, TablePaths, TxnOp};
use crate::error::{Error, Result};
use crate::part::PartName;

/// Persisted state of the in-flight quorum write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumStatus {
    pub part_name: String,
    pub required: usize,
    /// Replicas that confirmed durable installation (the writer is
    /// pre-counted)
    pub confirmed: BTreeSet<String>,
    /// Replicas that were active at insert time and are expected to confirm
    pub awaiting: BTreeSet<String>,
}

impl QuorumStatus {
    pub fn satisfied(&self) -> bool {
        self.confirmed.len() >= self.required
    }
}

/// Quorum bookkeeping for one replica
pub struct QuorumCoordinator {
    paths: TablePaths,
    replica_name: String,
    poll_interval: Duration,
}

impl QuorumCoordinator {
    pub fn new(paths: TablePaths, replica_name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            paths,
            replica_name: replica_name.into(),
            poll_interval,
        }
    }

    /// Transaction op creating the status node for a new quorum insert.
    /// `active` is the currently active replica set; the writer is counted
    /// as already confirmed.
    pub fn status_create_op(
        &self,
        part: &PartName,
        required: usize,
        active: &BTreeSet<String>,
    ) -> Result<TxnOp> {
        let status = QuorumStatus {
            part_name: part.to_string(),
            required,
            confirmed: BTreeSet::from([self.replica_name.clone()]),
            awaiting: active
                .iter()
                .filter(|r| **r != self.replica_name)
                .cloned()
                .collect(),
        };
        Ok(TxnOp::Create {
            path: self.paths.quorum_status(),
            data: serde_json::to_vec(&status)?,
            mode: CreateMode::Persistent,
        })
    }

    /// Record this replica's durable installation of `part`. Called exactly
    /// once per entry, after install; adding to a set makes retries
    /// harmless. Completing the quorum retires the status node and records
    /// the part as the last quorum-satisfied one.
    pub async fn confirm(&self, store: &dyn CoordinationStore, part: &PartName) -> Result<()> {
        let part_name = part.to_string();
        loop {
            let Some(node) = store.get(&self.paths.quorum_status()).await? else {
                return Ok(());
            };
            let mut status: QuorumStatus = serde_json::from_slice(&node.data)?;
            if status.part_name != part_name {
                return Ok(());
            }
            if !status.confirmed.insert(self.replica_name.clone()) {
                return Ok(());
            }
            status.awaiting.remove(&self.replica_name);

            let result = if status.satisfied() {
                store.ensure(&self.paths.quorum_last_part()).await?;
                store
                    .multi(vec![
                        TxnOp::Remove {
                            path: self.paths.quorum_status(),
                            version: Some(node.version),
                        },
                        TxnOp::Set {
                            path: self.paths.quorum_last_part(),
                            data: part_name.clone().into_bytes(),
                            version: None,
                        },
                    ])
                    .await
                    .map(|_| ())
            } else {
                store
                    .set(
                        &self.paths.quorum_status(),
                        &serde_json::to_vec(&status)?,
                        Some(node.version),
                    )
                    .await
                    .map(|_| ())
            };

            match result {
                Ok(()) => {
                    tracing::debug!(part = %part_name, replica = %self.replica_name, "quorum confirmation recorded");
                    return Ok(());
                }
                // Another replica confirmed concurrently; re-read and retry
                Err(Error::BadVersion { .. }) | Err(Error::TxnFailed { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Block the issuing insert until the quorum for `part` is satisfied,
    /// broken, or timed out. Liveness of awaited replicas is read from
    /// their ephemeral activity tags.
    pub async fn wait(
        &self,
        store: &dyn CoordinationStore,
        part: &PartName,
        required: usize,
        timeout: Duration,
    ) -> Result<()> {
        let part_name = part.to_string();
        let deadline = Instant::now() + timeout;

        loop {
            let (node, watch) = store.get_watch(&self.paths.quorum_status()).await?;

            let status = match node {
                Some(node) => {
                    let status: QuorumStatus = serde_json::from_slice(&node.data)?;
                    if status.part_name != part_name {
                        // Our quorum already completed and a newer insert
                        // took the status node over.
                        return Ok(());
                    }
                    Some((status, node.version))
                }
                None => None,
            };

            let (confirmed, version, broken) = match &status {
                None => {
                    // Status retired: the quorum completed
                    return Ok(());
                }
                Some((status, version)) => {
                    if status.satisfied() {
                        return Ok(());
                    }
                    // A replica that has neither confirmed nor stayed active
                    // can no longer contribute; the quorum breaks once the
                    // remaining candidates cannot reach the threshold.
                    let mut reachable = status.confirmed.len();
                    for replica in &status.awaiting {
                        if store.exists(&self.paths.is_active(replica)).await? {
                            reachable += 1;
                        }
                    }
                    (status.confirmed.len(), *version, reachable < status.required)
                }
            };

            if broken {
                // Retire the broken status so later inserts start clean; the
                // version check protects a successor insert's status. The
                // data stays committed locally and converges later.
                let _ = store.remove(&self.paths.quorum_status(), Some(version)).await;
                return Err(Error::QuorumBroken {
                    part: part_name,
                    confirmed,
                    required,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                let _ = store.remove(&self.paths.quorum_status(), Some(version)).await;
                return Err(Error::QuorumTimeout {
                    part: part_name,
                    confirmed,
                    required,
                    elapsed_ms: timeout.as_millis() as u64,
                });
            }

            let wait_slice = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = watch => {}
                _ = tokio::time::sleep(wait_slice) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;

    fn coordinator(replica: &str) -> QuorumCoordinator {
        QuorumCoordinator::new(TablePaths::new("/t"), replica, Duration::from_millis(20))
    }

    async fn setup_active(coord: &MemoryCoordination, replicas: &[&str]) -> Vec<std::sync::Arc<crate::coordination::memory::MemorySession>> {
        let mut sessions = Vec::new();
        for name in replicas {
            let session = coord.session();
            session.ensure(&format!("/t/replicas/{}", name)).await.unwrap();
            session
                .create(
                    &format!("/t/replicas/{}/is_active", name),
                    name.as_bytes(),
                    crate::coordination::CreateMode::Ephemeral,
                )
                .await
                .unwrap();
            sessions.push(session);
        }
        sessions[0].ensure("/t/quorum").await.unwrap();
        sessions
    }

    #[tokio::test]
    async fn test_quorum_satisfied_by_confirmations() {
        let coord = MemoryCoordination::new();
        let sessions = setup_active(&coord, &["r1", "r2"]).await;
        let part = PartName::parse("p_0_0_0").unwrap();

        let writer = coordinator("r1");
        let active = BTreeSet::from(["r1".to_string(), "r2".to_string()]);
        sessions[0]
            .multi(vec![writer.status_create_op(&part, 2, &active).unwrap()])
            .await
            .unwrap();

        let confirmer = coordinator("r2");
        let confirm_session = sessions[1].clone();
        let confirm_part = part.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            confirmer
                .confirm(confirm_session.as_ref(), &confirm_part)
                .await
                .unwrap();
        });

        writer
            .wait(sessions[0].as_ref(), &part, 2, Duration::from_secs(2))
            .await
            .unwrap();
        handle.await.unwrap();

        // Status retired, last quorum part recorded
        assert!(!sessions[0].exists("/t/quorum/status").await.unwrap());
        let last = sessions[0].get("/t/quorum/last_part").await.unwrap().unwrap();
        assert_eq!(last.data, b"p_0_0_0");
    }

    #[tokio::test]
    async fn test_quorum_breaks_when_replica_dies() {
        let coord = MemoryCoordination::new();
        let sessions = setup_active(&coord, &["r1", "r2", "r3"]).await;
        let part = PartName::parse("p_0_0_0").unwrap();

        let writer = coordinator("r1");
        let active = BTreeSet::from(["r1".to_string(), "r2".to_string(), "r3".to_string()]);
        sessions[0]
            .multi(vec![writer.status_create_op(&part, 3, &active).unwrap()])
            .await
            .unwrap();

        // Kill r3 mid-wait; r2 never confirms either, so only two
        // candidates remain and quorum 3 is unreachable.
        let kill_id = sessions[2].session_id();
        let coord2 = coord.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            coord2.expire_session(kill_id);
        });

        let err = writer
            .wait(sessions[0].as_ref(), &part, 3, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuorumBroken { confirmed: 1, required: 3, .. }));
    }

    #[tokio::test]
    async fn test_quorum_timeout() {
        let coord = MemoryCoordination::new();
        let sessions = setup_active(&coord, &["r1", "r2"]).await;
        let part = PartName::parse("p_0_0_0").unwrap();

        let writer = coordinator("r1");
        let active = BTreeSet::from(["r1".to_string(), "r2".to_string()]);
        sessions[0]
            .multi(vec![writer.status_create_op(&part, 2, &active).unwrap()])
            .await
            .unwrap();

        // r2 stays active but never confirms
        let err = writer
            .wait(sessions[0].as_ref(), &part, 2, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuorumTimeout { .. }));
    }
}
