//! Leader Election
//!
//! Exactly one live replica holds the lowest-sequence ephemeral node under
//! `/leader_election` and acts as leader: only the leader schedules merges
//! and mutations. Election nodes die with their session, so leadership
//! moves automatically when the holder disappears.

use tokio::sync::{watch, RwLock};

use crate::coordination::{sequence_of, CoordinationStore, CreateMode, TablePaths};
use crate::error::{Error, Result};

/// Leader election participant for one replica
pub struct LeaderElection {
    paths: TablePaths,
    replica_name: String,
    /// Node name this replica currently holds under the election dir
    my_node: RwLock<Option<String>>,
    is_leader_tx: watch::Sender<bool>,
    is_leader_rx: watch::Receiver<bool>,
}

impl LeaderElection {
    pub fn new(paths: TablePaths, replica_name: impl Into<String>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            paths,
            replica_name: replica_name.into(),
            my_node: RwLock::new(None),
            is_leader_tx: tx,
            is_leader_rx: rx,
        }
    }

    /// Enter the election. Called at startup and again after session loss;
    /// any previous node is abandoned (it died with the old session).
    pub async fn register(&self, store: &dyn CoordinationStore) -> Result<()> {
        let created = store
            .create(
                &self.paths.leader_election_prefix(),
                self.replica_name.as_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let node = created.rsplit('/').next().unwrap_or(&created).to_string();
        tracing::debug!(replica = %self.replica_name, node = %node, "registered for leader election");
        *self.my_node.write().await = Some(node);
        self.refresh(store).await?;
        Ok(())
    }

    /// Re-evaluate leadership from the election nodes. Returns whether this
    /// replica is now the leader.
    pub async fn refresh(&self, store: &dyn CoordinationStore) -> Result<bool> {
        let my_node = self.my_node.read().await.clone();
        let Some(my_node) = my_node else {
            self.update(false);
            return Ok(false);
        };

        let children = store.children(&self.paths.leader_election_dir()).await?;
        if !children.iter().any(|c| c == &my_node) {
            // Our node is gone: the session that created it has expired.
            self.update(false);
            return Err(Error::SessionExpired);
        }

        let my_seq = sequence_of(&my_node)?;
        let min_seq = children
            .iter()
            .filter_map(|c| sequence_of(c).ok())
            .min()
            .unwrap_or(my_seq);

        let is_leader = my_seq == min_seq;
        self.update(is_leader);
        Ok(is_leader)
    }

    /// The replica currently holding leadership, if any
    pub async fn current_leader(&self, store: &dyn CoordinationStore) -> Result<Option<String>> {
        let children = store.children(&self.paths.leader_election_dir()).await?;
        let lowest = children
            .iter()
            .filter_map(|c| sequence_of(c).ok().map(|seq| (seq, c)))
            .min();
        match lowest {
            Some((_, node)) => {
                let path = format!("{}/{}", self.paths.leader_election_dir(), node);
                Ok(store
                    .get(&path)
                    .await?
                    .map(|n| String::from_utf8_lossy(&n.data).into_owned()))
            }
            None => Ok(None),
        }
    }

    /// Leave the election (shutdown)
    pub async fn resign(&self, store: &dyn CoordinationStore) -> Result<()> {
        let node = self.my_node.write().await.take();
        if let Some(node) = node {
            let path = format!("{}/{}", self.paths.leader_election_dir(), node);
            match store.remove(&path, None).await {
                Ok(()) | Err(Error::NodeNotFound(_)) | Err(Error::SessionExpired) => {}
                Err(e) => return Err(e),
            }
        }
        self.update(false);
        Ok(())
    }

    /// Forget local election state without touching the store. Used when the
    /// session is already gone.
    pub async fn reset(&self) {
        *self.my_node.write().await = None;
        self.update(false);
    }

    pub fn is_leader(&self) -> bool {
        *self.is_leader_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.is_leader_rx.clone()
    }

    fn update(&self, is_leader: bool) {
        let was = *self.is_leader_rx.borrow();
        if was != is_leader {
            tracing::info!(
                replica = %self.replica_name,
                is_leader,
                "leadership changed"
            );
        }
        let _ = self.is_leader_tx.send(is_leader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;

    #[tokio::test]
    async fn test_first_registrant_leads() {
        let coord = MemoryCoordination::new();
        let s1 = coord.session();
        s1.ensure("/t/leader_election").await.unwrap();
        let s2 = coord.session();

        let e1 = LeaderElection::new(TablePaths::new("/t"), "r1");
        let e2 = LeaderElection::new(TablePaths::new("/t"), "r2");

        e1.register(s1.as_ref()).await.unwrap();
        e2.register(s2.as_ref()).await.unwrap();

        assert!(e1.is_leader());
        assert!(!e2.is_leader());
        assert_eq!(
            e1.current_leader(s1.as_ref()).await.unwrap().as_deref(),
            Some("r1")
        );
    }

    #[tokio::test]
    async fn test_leadership_moves_on_session_expiry() {
        let coord = MemoryCoordination::new();
        let s1 = coord.session();
        s1.ensure("/t/leader_election").await.unwrap();
        let s2 = coord.session();

        let e1 = LeaderElection::new(TablePaths::new("/t"), "r1");
        let e2 = LeaderElection::new(TablePaths::new("/t"), "r2");
        e1.register(s1.as_ref()).await.unwrap();
        e2.register(s2.as_ref()).await.unwrap();
        assert!(!e2.is_leader());

        coord.expire_session(s1.session_id());
        assert!(e2.refresh(s2.as_ref()).await.unwrap());
        assert!(e2.is_leader());
    }

    #[tokio::test]
    async fn test_expired_holder_detects_lost_node() {
        let coord = MemoryCoordination::new();
        let s1 = coord.session();
        s1.ensure("/t/leader_election").await.unwrap();

        let e1 = LeaderElection::new(TablePaths::new("/t"), "r1");
        e1.register(s1.as_ref()).await.unwrap();
        assert!(e1.is_leader());

        coord.expire_session(s1.session_id());
        let s1b = coord.session();
        assert!(matches!(
            e1.refresh(s1b.as_ref()).await,
            Err(Error::SessionExpired)
        ));
        assert!(!e1.is_leader());
    }
}
