//! In-Memory Coordination Backend
//!
//! A process-local implementation of the coordination service with real
//! session semantics: ephemeral nodes die with their session, sequential
//! nodes get monotonically increasing suffixes, watches fire on changes,
//! and transactions apply atomically. Used by tests and single-process
//! clusters; production deployments plug a real backend into the same
//! `CoordinationStore` trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};

use super::{CoordinationStore, CreateMode, NodeData, TxnOp, TxnResult, Watch};
use crate::error::{Error, Result};

struct ZNode {
    data: Vec<u8>,
    version: u64,
    created: DateTime<Utc>,
    owner: Option<u64>,
    seq_counter: u64,
}

impl ZNode {
    fn new(data: Vec<u8>, owner: Option<u64>) -> Self {
        Self {
            data,
            version: 0,
            created: Utc::now(),
            owner,
            seq_counter: 0,
        }
    }
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, ZNode>,
    node_watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    child_watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    sessions: HashMap<u64, watch::Sender<bool>>,
    next_session: u64,
}

impl State {
    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) => "/",
            Some(idx) => &path[..idx],
            None => "/",
        }
    }

    fn validate_path(path: &str) -> Result<()> {
        if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
            return Err(Error::Coordination(format!("malformed path: {}", path)));
        }
        Ok(())
    }

    fn notify(&mut self, path: &str) {
        if let Some(senders) = self.node_watches.remove(path) {
            for tx in senders {
                let _ = tx.send(());
            }
        }
        let parent = Self::parent_of(path).to_string();
        if let Some(senders) = self.child_watches.remove(&parent) {
            for tx in senders {
                let _ = tx.send(());
            }
        }
    }

    fn check_create(&self, path: &str, mode: CreateMode) -> Result<()> {
        Self::validate_path(path)?;
        let parent = Self::parent_of(path);
        if !self.nodes.contains_key(parent) {
            return Err(Error::NodeNotFound(parent.to_string()));
        }
        if !mode.is_sequential() && self.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }
        Ok(())
    }

    fn apply_create(
        &mut self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        session: u64,
    ) -> Result<String> {
        self.check_create(path, mode)?;

        let parent = Self::parent_of(path).to_string();
        let full_path = if mode.is_sequential() {
            let parent_node = self.nodes.get_mut(&parent).expect("parent checked above");
            let seq = parent_node.seq_counter;
            parent_node.seq_counter += 1;
            format!("{}{:010}", path, seq)
        } else {
            path.to_string()
        };

        let owner = mode.is_ephemeral().then_some(session);
        self.nodes.insert(full_path.clone(), ZNode::new(data, owner));
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.version += 1;
        }
        self.notify(&full_path);
        Ok(full_path)
    }

    fn check_version(&self, path: &str, expected: Option<u64>) -> Result<&ZNode> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| Error::NodeNotFound(path.to_string()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        Ok(node)
    }

    fn apply_set(&mut self, path: &str, data: Vec<u8>, version: Option<u64>) -> Result<u64> {
        self.check_version(path, version)?;
        let node = self.nodes.get_mut(path).expect("checked above");
        node.data = data;
        node.version += 1;
        let new_version = node.version;
        self.notify(path);
        Ok(new_version)
    }

    fn check_remove(&self, path: &str, version: Option<u64>) -> Result<()> {
        self.check_version(path, version)?;
        let child_prefix = format!("{}/", path);
        if self.nodes.range(child_prefix.clone()..).next().map_or(false, |(k, _)| k.starts_with(&child_prefix)) {
            return Err(Error::Coordination(format!("node {} has children", path)));
        }
        Ok(())
    }

    fn apply_remove(&mut self, path: &str, version: Option<u64>) -> Result<()> {
        self.check_remove(path, version)?;
        self.nodes.remove(path);
        let parent = Self::parent_of(path).to_string();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.version += 1;
        }
        self.notify(path);
        Ok(())
    }

    fn child_names(&self, path: &str) -> Result<Vec<String>> {
        if !self.nodes.contains_key(path) {
            return Err(Error::NodeNotFound(path.to_string()));
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut names = Vec::new();
        for (key, _) in self.nodes.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            if !rest.is_empty() && !rest.contains('/') {
                names.push(rest.to_string());
            }
        }
        Ok(names)
    }

    fn check_txn_op(&self, op: &TxnOp) -> Result<()> {
        match op {
            TxnOp::Create { path, mode, .. } => self.check_create(path, *mode),
            TxnOp::Set { path, version, .. } => self.check_version(path, *version).map(|_| ()),
            TxnOp::Remove { path, version } => self.check_remove(path, *version),
            TxnOp::Check { path, version } => self.check_version(path, *version).map(|_| ()),
        }
    }
}

struct Shared {
    state: Mutex<State>,
}

/// Process-local coordination service shared by all sessions of a test or
/// embedded cluster
#[derive(Clone)]
pub struct MemoryCoordination {
    shared: Arc<Shared>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert("/".to_string(), ZNode::new(Vec::new(), None));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
            }),
        }
    }

    /// Open a new session. Each replica owns exactly one live session at a
    /// time and replaces it wholesale after expiry.
    pub fn session(&self) -> Arc<MemorySession> {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = watch::channel(false);
        state.sessions.insert(id, tx);
        Arc::new(MemorySession {
            shared: Arc::clone(&self.shared),
            id,
            expired: rx,
        })
    }

    /// A factory producing fresh sessions, used to rebuild after expiry
    pub fn session_factory(&self) -> super::SessionFactory {
        let this = self.clone();
        Arc::new(
            move || -> futures::future::BoxFuture<'static, Result<Arc<dyn CoordinationStore>>> {
                let this = this.clone();
                Box::pin(async move {
                    let store: Arc<dyn CoordinationStore> = this.session();
                    Ok(store)
                })
            },
        )
    }

    /// Expire a session: its ephemeral nodes vanish, watches on them fire,
    /// and every operation through its handle starts failing
    pub fn expire_session(&self, id: u64) {
        let mut state = self.shared.state.lock().unwrap();
        let ephemerals: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        for path in ephemerals {
            state.nodes.remove(&path);
            let parent = State::parent_of(&path).to_string();
            if let Some(parent_node) = state.nodes.get_mut(&parent) {
                parent_node.version += 1;
            }
            state.notify(&path);
        }
        if let Some(tx) = state.sessions.remove(&id) {
            let _ = tx.send(true);
        }
    }

    /// Number of live sessions, for diagnostics
    pub fn live_sessions(&self) -> usize {
        self.shared.state.lock().unwrap().sessions.len()
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

/// One session's handle onto the in-memory coordination service
pub struct MemorySession {
    shared: Arc<Shared>,
    id: u64,
    expired: watch::Receiver<bool>,
}

impl MemorySession {
    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        let state = self.shared.state.lock().unwrap();
        if !state.sessions.contains_key(&self.id) {
            return Err(Error::SessionExpired);
        }
        Ok(state)
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let mut state = self.state()?;
        state.apply_create(path, data.to_vec(), mode, self.id)
    }

    async fn ensure(&self, path: &str) -> Result<()> {
        let mut state = self.state()?;
        State::validate_path(path)?;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = format!("{}/{}", current, segment);
            if !state.nodes.contains_key(&current) {
                state.apply_create(&current, Vec::new(), CreateMode::Persistent, self.id)?;
            }
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<NodeData>> {
        let state = self.state()?;
        Ok(state.nodes.get(path).map(|n| NodeData {
            data: n.data.clone(),
            version: n.version,
            created: n.created,
        }))
    }

    async fn get_watch(&self, path: &str) -> Result<(Option<NodeData>, Watch)> {
        let mut state = self.state()?;
        let data = state.nodes.get(path).map(|n| NodeData {
            data: n.data.clone(),
            version: n.version,
            created: n.created,
        });
        let (tx, rx) = oneshot::channel();
        state.node_watches.entry(path.to_string()).or_default().push(tx);
        Ok((data, rx))
    }

    async fn set(&self, path: &str, data: &[u8], version: Option<u64>) -> Result<u64> {
        let mut state = self.state()?;
        state.apply_set(path, data.to_vec(), version)
    }

    async fn remove(&self, path: &str, version: Option<u64>) -> Result<()> {
        let mut state = self.state()?;
        state.apply_remove(path, version)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let state = self.state()?;
        Ok(state.nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let state = self.state()?;
        state.child_names(path)
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let mut state = self.state()?;
        let names = state.child_names(path)?;
        let (tx, rx) = oneshot::channel();
        state.child_watches.entry(path.to_string()).or_default().push(tx);
        Ok((names, rx))
    }

    async fn multi(&self, ops: Vec<TxnOp>) -> Result<Vec<TxnResult>> {
        let mut state = self.state()?;

        // Operations must be mutually independent: each is validated against
        // the pre-transaction state, then all are applied.
        for (index, op) in ops.iter().enumerate() {
            state.check_txn_op(op).map_err(|e| Error::TxnFailed {
                index,
                reason: e.to_string(),
            })?;
        }

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                TxnOp::Create { path, data, mode } => {
                    let created = state.apply_create(&path, data, mode, self.id)?;
                    TxnResult::Created { path: created }
                }
                TxnOp::Set { path, data, version } => {
                    let version = state.apply_set(&path, data, version)?;
                    TxnResult::Set { version }
                }
                TxnOp::Remove { path, version } => {
                    state.apply_remove(&path, version)?;
                    TxnResult::Removed
                }
                TxnOp::Check { .. } => TxnResult::Checked,
            };
            results.push(result);
        }
        Ok(results)
    }

    fn session_id(&self) -> u64 {
        self.id
    }

    fn expired(&self) -> watch::Receiver<bool> {
        self.expired.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_set_remove() {
        let coord = MemoryCoordination::new();
        let session = coord.session();

        session.ensure("/table/log").await.unwrap();
        session
            .create("/table/log/entry", b"v1", CreateMode::Persistent)
            .await
            .unwrap();

        let node = session.get("/table/log/entry").await.unwrap().unwrap();
        assert_eq!(node.data, b"v1");
        assert_eq!(node.version, 0);

        let v = session.set("/table/log/entry", b"v2", Some(0)).await.unwrap();
        assert_eq!(v, 1);
        assert!(matches!(
            session.set("/table/log/entry", b"v3", Some(0)).await,
            Err(Error::BadVersion { .. })
        ));

        session.remove("/table/log/entry", None).await.unwrap();
        assert!(session.get("/table/log/entry").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sequential_nodes_are_ordered() {
        let coord = MemoryCoordination::new();
        let session = coord.session();
        session.ensure("/t/log").await.unwrap();

        let a = session
            .create("/t/log/log-", b"a", CreateMode::PersistentSequential)
            .await
            .unwrap();
        let b = session
            .create("/t/log/log-", b"b", CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(a, "/t/log/log-0000000000");
        assert_eq!(b, "/t/log/log-0000000001");

        let children = session.children("/t/log").await.unwrap();
        assert_eq!(children, vec!["log-0000000000", "log-0000000001"]);
    }

    #[tokio::test]
    async fn test_ephemeral_dies_with_session() {
        let coord = MemoryCoordination::new();
        let session = coord.session();
        session.ensure("/t/replicas/r1").await.unwrap();
        session
            .create("/t/replicas/r1/is_active", b"", CreateMode::Ephemeral)
            .await
            .unwrap();

        let observer = coord.session();
        assert!(observer.exists("/t/replicas/r1/is_active").await.unwrap());

        coord.expire_session(session.session_id());
        assert!(!observer.exists("/t/replicas/r1/is_active").await.unwrap());
        assert!(matches!(
            session.exists("/t/replicas/r1/is_active").await,
            Err(Error::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_watch_fires_on_change() {
        let coord = MemoryCoordination::new();
        let session = coord.session();
        session.ensure("/t").await.unwrap();
        session.create("/t/node", b"x", CreateMode::Persistent).await.unwrap();

        let (_, watch) = session.get_watch("/t/node").await.unwrap();
        session.set("/t/node", b"y", None).await.unwrap();
        watch.await.unwrap();

        let (children, watch) = session.children_watch("/t").await.unwrap();
        assert_eq!(children, vec!["node"]);
        session.create("/t/other", b"", CreateMode::Persistent).await.unwrap();
        watch.await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_is_atomic() {
        let coord = MemoryCoordination::new();
        let session = coord.session();
        session.ensure("/t").await.unwrap();
        session.create("/t/a", b"", CreateMode::Persistent).await.unwrap();

        // Second op fails validation, so the first op must not apply
        let err = session
            .multi(vec![
                TxnOp::Create {
                    path: "/t/b".into(),
                    data: vec![],
                    mode: CreateMode::Persistent,
                },
                TxnOp::Create {
                    path: "/t/a".into(),
                    data: vec![],
                    mode: CreateMode::Persistent,
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TxnFailed { index: 1, .. }));
        assert!(!session.exists("/t/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_parent_version_tracks_children() {
        let coord = MemoryCoordination::new();
        let session = coord.session();
        session.ensure("/t/log").await.unwrap();
        let before = session.get("/t/log").await.unwrap().unwrap().version;
        session
            .create("/t/log/log-", b"", CreateMode::PersistentSequential)
            .await
            .unwrap();
        let after = session.get("/t/log").await.unwrap().unwrap().version;
        assert_eq!(after, before + 1);
    }
}
