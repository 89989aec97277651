//! Coordination Client Facade
//!
//! Logical operations over the external linearizable coordination service:
//! hierarchical paths, ephemeral and sequential nodes, change watches, and
//! atomic multi-operation transactions. The service itself is an external
//! collaborator; `MemoryCoordination` provides an in-process backend with
//! full session semantics for tests and single-process clusters.

pub mod memory;
pub mod paths;
mod session;

pub use memory::MemoryCoordination;
pub use paths::TablePaths;
pub use session::{Session, SessionFactory};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};

use crate::error::Result;

/// Node creation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Value and metadata of a coordination node
#[derive(Debug, Clone)]
pub struct NodeData {
    pub data: Vec<u8>,
    /// Bumped on every set, and on child create/remove for parent nodes
    pub version: u64,
    pub created: DateTime<Utc>,
}

/// One-shot watch: resolves when the watched node (or child set) changes.
/// The sender side being dropped also resolves the watch, so a lost session
/// never leaves a waiter hanging.
pub type Watch = oneshot::Receiver<()>;

/// One operation of an atomic transaction
#[derive(Debug, Clone)]
pub enum TxnOp {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Set {
        path: String,
        data: Vec<u8>,
        version: Option<u64>,
    },
    Remove {
        path: String,
        version: Option<u64>,
    },
    /// Fails the transaction unless the node exists (and, when given,
    /// carries the expected version)
    Check {
        path: String,
        version: Option<u64>,
    },
}

/// Result of one transaction operation
#[derive(Debug, Clone)]
pub enum TxnResult {
    Created { path: String },
    Set { version: u64 },
    Removed,
    Checked,
}

/// Logical operations over the coordination service, scoped to one session.
///
/// All ephemeral nodes created through a store handle die with its session.
/// After expiry every operation fails with `Error::SessionExpired`; the
/// handle must be discarded and replaced wholesale.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node; returns the full path actually created (sequential
    /// modes append the sequence number)
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Create a persistent node and all missing ancestors; succeeds if the
    /// node already exists
    async fn ensure(&self, path: &str) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<NodeData>>;

    /// Read a node and register a one-shot watch on it (fires on create,
    /// set, or remove)
    async fn get_watch(&self, path: &str) -> Result<(Option<NodeData>, Watch)>;

    /// Set node data; `version` of `Some` makes the write conditional
    async fn set(&self, path: &str, data: &[u8], version: Option<u64>) -> Result<u64>;

    async fn remove(&self, path: &str, version: Option<u64>) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Direct child names (not full paths), sorted
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Child names plus a one-shot watch firing on any child create/remove
    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Execute all operations atomically; either all apply or none
    async fn multi(&self, ops: Vec<TxnOp>) -> Result<Vec<TxnResult>>;

    /// Session identity, for diagnostics
    fn session_id(&self) -> u64;

    /// Receiver flipping to `true` when this session expires
    fn expired(&self) -> watch::Receiver<bool>;
}

/// Extract the sequence number from a sequentially created node name,
/// e.g. `log-0000000042` -> 42
pub fn sequence_of(node_name: &str) -> Result<u64> {
    let digits = node_name
        .rsplit(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("");
    digits
        .parse()
        .map_err(|_| crate::Error::Coordination(format!("node {} has no sequence suffix", node_name)))
}
